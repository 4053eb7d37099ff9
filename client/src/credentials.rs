//! Credential discovery from the Vercel CLI and the environment.
//!
//! Token: CLI `auth.json`, then `VERCEL_TOKEN`.
//! Team: `.vercel/project.json` `orgId`, then CLI `config.json`
//! `currentTeam`, then `VERCEL_TEAM_ID`.
//! Project: `.vercel/project.json`, then `VERCEL_PROJECT_ID`.

use burrow_shared::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub team_id: String,
    pub project_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("team_id", &self.team_id)
            .field("project_id", &self.project_id)
            .finish()
    }
}

pub trait CredentialResolver {
    fn resolve(&self) -> Result<Credentials>;
}

#[derive(Deserialize)]
struct AuthFile {
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GlobalConfigFile {
    current_team: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProjectFile {
    org_id: Option<String>,
    project_id: Option<String>,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct VercelCredentials {
    cli_dir: Option<PathBuf>,
    project_dir: PathBuf,
    env: EnvLookup,
}

impl VercelCredentials {
    /// CLI data dir under the platform data directory, project from cwd
    pub fn discover() -> Result<Self> {
        let project_dir = std::env::current_dir()?;
        Ok(Self {
            cli_dir: dirs::data_dir().map(|d| d.join("com.vercel.cli")),
            project_dir,
            env: Box::new(|key| std::env::var(key).ok()),
        })
    }

    pub fn new(cli_dir: Option<PathBuf>, project_dir: PathBuf, env: EnvLookup) -> Self {
        Self {
            cli_dir,
            project_dir,
            env,
        }
    }

    fn env_var(&self, key: &str) -> Option<String> {
        (self.env)(key).filter(|v| !v.is_empty())
    }

    fn cli_file<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.cli_dir.as_ref().and_then(|dir| read_json(&dir.join(name)))
    }
}

impl CredentialResolver for VercelCredentials {
    fn resolve(&self) -> Result<Credentials> {
        let project: ProjectFile =
            read_json(&self.project_dir.join(".vercel").join("project.json")).unwrap_or_default();

        let token = self
            .cli_file::<AuthFile>("auth.json")
            .and_then(|a| a.token)
            .filter(|t| !t.is_empty())
            .or_else(|| self.env_var("VERCEL_TOKEN"))
            .ok_or_else(|| {
                Error::Configuration(
                    "No Vercel token found.\nPlease run `vercel login` or set the VERCEL_TOKEN environment variable."
                        .into(),
                )
            })?;

        let team_id = project
            .org_id
            .filter(|t| !t.is_empty())
            .or_else(|| {
                self.cli_file::<GlobalConfigFile>("config.json")
                    .and_then(|c| c.current_team)
                    .filter(|t| !t.is_empty())
            })
            .or_else(|| self.env_var("VERCEL_TEAM_ID"))
            .ok_or_else(|| {
                Error::Configuration(
                    "No Vercel team found.\nPlease run `vercel link` in your project directory, or set the VERCEL_TEAM_ID environment variable."
                        .into(),
                )
            })?;

        let project_id = project
            .project_id
            .filter(|p| !p.is_empty())
            .or_else(|| self.env_var("VERCEL_PROJECT_ID"))
            .ok_or_else(|| {
                Error::Configuration(
                    "No Vercel project found.\nPlease run `vercel link` in your project directory, or set the VERCEL_PROJECT_ID environment variable."
                        .into(),
                )
            })?;

        Ok(Credentials {
            token,
            team_id,
            project_id,
        })
    }
}

/// Missing or unreadable files count as absent
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> EnvLookup {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(move |key| map.get(key).cloned())
    }

    fn write(path: PathBuf, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_files_take_priority() {
        let cli = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        write(cli.path().join("auth.json"), r#"{"token":"file-token"}"#);
        write(cli.path().join("config.json"), r#"{"currentTeam":"team_global"}"#);
        write(
            project.path().join(".vercel/project.json"),
            r#"{"orgId":"team_local","projectId":"prj_1"}"#,
        );

        let resolver = VercelCredentials::new(
            Some(cli.path().to_path_buf()),
            project.path().to_path_buf(),
            env(&[("VERCEL_TOKEN", "env-token"), ("VERCEL_TEAM_ID", "team_env")]),
        );
        let creds = resolver.resolve().unwrap();
        assert_eq!(creds.token, "file-token");
        assert_eq!(creds.team_id, "team_local");
        assert_eq!(creds.project_id, "prj_1");
    }

    #[test]
    fn test_global_team_then_env() {
        let cli = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        write(cli.path().join("config.json"), r#"{"currentTeam":"team_global"}"#);

        let resolver = VercelCredentials::new(
            Some(cli.path().to_path_buf()),
            project.path().to_path_buf(),
            env(&[
                ("VERCEL_TOKEN", "env-token"),
                ("VERCEL_TEAM_ID", "team_env"),
                ("VERCEL_PROJECT_ID", "prj_env"),
            ]),
        );
        let creds = resolver.resolve().unwrap();
        assert_eq!(creds.token, "env-token");
        assert_eq!(creds.team_id, "team_global");
        assert_eq!(creds.project_id, "prj_env");
    }

    #[test]
    fn test_empty_values_fall_through() {
        let cli = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        write(cli.path().join("config.json"), r#"{"currentTeam":"team_global"}"#);
        write(cli.path().join("auth.json"), r#"{"token":""}"#);
        write(
            project.path().join(".vercel/project.json"),
            r#"{"orgId":"","projectId":"prj_1"}"#,
        );

        let resolver = VercelCredentials::new(
            Some(cli.path().to_path_buf()),
            project.path().to_path_buf(),
            env(&[("VERCEL_TOKEN", "env-token")]),
        );
        let creds = resolver.resolve().unwrap();
        assert_eq!(creds.token, "env-token");
        assert_eq!(creds.team_id, "team_global");

        write(cli.path().join("config.json"), r#"{"currentTeam":""}"#);
        let resolver = VercelCredentials::new(
            Some(cli.path().to_path_buf()),
            project.path().to_path_buf(),
            env(&[("VERCEL_TOKEN", "env-token"), ("VERCEL_TEAM_ID", "team_env")]),
        );
        assert_eq!(resolver.resolve().unwrap().team_id, "team_env");
    }

    #[test]
    fn test_missing_fields_name_the_remedy() {
        let project = TempDir::new().unwrap();
        let resolver = VercelCredentials::new(None, project.path().to_path_buf(), env(&[]));
        let err = resolver.resolve().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("vercel login"));

        let resolver = VercelCredentials::new(None, project.path().to_path_buf(), env(&[("VERCEL_TOKEN", "t")]));
        assert!(resolver.resolve().unwrap_err().to_string().contains("VERCEL_TEAM_ID"));

        let resolver = VercelCredentials::new(
            None,
            project.path().to_path_buf(),
            env(&[("VERCEL_TOKEN", "t"), ("VERCEL_TEAM_ID", "team")]),
        );
        assert!(resolver.resolve().unwrap_err().to_string().contains("VERCEL_PROJECT_ID"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials {
            token: "secret".into(),
            team_id: "team".into(),
            project_id: "prj".into(),
        };
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
