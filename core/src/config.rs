use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;
use crate::error::RyeErr;
use crate::flags::USER_SPACE;

/// Name of the per-space item tree root.
pub const AI_DIR: &str = ".ai";

/// Constant instruction returned with in-thread directive execution.
pub const DIRECTIVE_INSTRUCTION: &str = "Execute the directive as specified now.";

/// A registered system bundle: an immutable `.ai/` tree shipped outside the
/// project and user spaces.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemBundle {
    pub bundle_id: String,
    pub root_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BundleRegistry {
    #[serde(default)]
    bundles: Vec<SystemBundle>,
}

/// Resolved space roots for one process. Owns no other state; every
/// component that needs path resolution takes a `&Config`.
///
/// Tests construct one against tempdirs; nothing here reads global mutable
/// state after construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_path: Option<PathBuf>,
    pub user_space: PathBuf,
    pub system_bundles: Vec<SystemBundle>,
}

impl Config {
    /// Resolve spaces from the environment: `USER_SPACE` overrides `$HOME`,
    /// and system bundles come from `{user_space}/.ai/config/bundles.toml`
    /// when present.
    pub fn load(project_path: Option<PathBuf>) -> Result<Self> {
        let user_space = match *USER_SPACE {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .ok_or_else(|| RyeErr::Configuration("cannot determine home directory".into()))?,
        };
        Self::with_spaces(project_path, user_space)
    }

    /// Construct against explicit roots. Used by tests and by callers that
    /// already resolved the spaces.
    pub fn with_spaces(project_path: Option<PathBuf>, user_space: PathBuf) -> Result<Self> {
        let registry_path = user_space.join(AI_DIR).join("config").join("bundles.toml");
        let system_bundles = if registry_path.is_file() {
            let raw = std::fs::read_to_string(&registry_path)?;
            let registry: BundleRegistry = toml::from_str(&raw)?;
            registry.bundles
        } else {
            Vec::new()
        };
        Ok(Self {
            project_path,
            user_space,
            system_bundles,
        })
    }

    pub fn project_ai_dir(&self) -> Option<PathBuf> {
        self.project_path.as_ref().map(|p| p.join(AI_DIR))
    }

    pub fn user_ai_dir(&self) -> PathBuf {
        self.user_space.join(AI_DIR)
    }

    /// `{project}/.ai/agent/threads`, falling back to the user space when no
    /// project is configured.
    pub fn threads_dir(&self) -> PathBuf {
        self.writable_ai_dir().join("agent").join("threads")
    }

    pub fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.threads_dir().join(thread_id)
    }

    /// Signing keypair directory: `{user_space}/.ai/keys`.
    pub fn keys_dir(&self) -> PathBuf {
        self.user_ai_dir().join("keys")
    }

    /// Auth token directory: `{user_space}/.ai/auth`.
    pub fn auth_dir(&self) -> PathBuf {
        self.user_ai_dir().join("auth")
    }

    /// The writable `.ai` root: project when present, else user.
    pub fn writable_ai_dir(&self) -> PathBuf {
        self.project_ai_dir().unwrap_or_else(|| self.user_ai_dir())
    }

    /// Ordered `(space_label, ai_dir)` pairs for read resolution:
    /// project → user → each system bundle.
    pub fn search_ai_dirs(&self) -> Vec<(String, PathBuf)> {
        let mut dirs = Vec::new();
        if let Some(project) = self.project_ai_dir() {
            dirs.push(("project".to_string(), project));
        }
        dirs.push(("user".to_string(), self.user_ai_dir()));
        for bundle in &self.system_bundles {
            dirs.push((
                format!("system:{}", bundle.bundle_id),
                bundle.root_path.join(AI_DIR),
            ));
        }
        dirs
    }
}

/// Create the parent directory of `path` if missing.
pub fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn search_order_is_project_user_system() {
        let tmp = tempfile::tempdir().unwrap();
        let user = tmp.path().join("home");
        let config_dir = user.join(".ai").join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("bundles.toml"),
            "[[bundles]]\nbundle_id = \"ryeos\"\nroot_path = \"/opt/ryeos\"\n",
        )
        .unwrap();

        let project = tmp.path().join("proj");
        let config = Config::with_spaces(Some(project.clone()), user.clone()).unwrap();
        let dirs = config.search_ai_dirs();
        assert_eq!(dirs.len(), 3);
        assert_eq!(dirs[0].0, "project");
        assert_eq!(dirs[1].0, "user");
        assert_eq!(dirs[2].0, "system:ryeos");
        assert_eq!(dirs[2].1, PathBuf::from("/opt/ryeos/.ai"));
    }

    #[test]
    fn writable_dir_prefers_project() {
        let tmp = tempfile::tempdir().unwrap();
        let user = tmp.path().join("home");
        let config = Config::with_spaces(None, user.clone()).unwrap();
        assert_eq!(config.writable_ai_dir(), user.join(".ai"));

        let with_project =
            Config::with_spaces(Some(tmp.path().join("proj")), user.clone()).unwrap();
        assert_eq!(
            with_project.threads_dir(),
            tmp.path().join("proj/.ai/agent/threads")
        );
    }
}
