use keyed_exec_core::{ExecError, DEFAULT_MAX_QUEUE_SIZE};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Items allowed per key, counting the one currently executing
    pub max_queue_size: usize,
    /// Worker threads are named `<prefix>-<key>`
    pub thread_name_prefix: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            thread_name_prefix: "kx".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ManagerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> keyed_exec_core::Result<()> {
        if self.max_queue_size == 0 {
            return Err(ExecError::InvalidConfig(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(ExecError::InvalidConfig(
                "thread_name_prefix may not contain NUL".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_queue_size, 1);
        assert_eq!(config.thread_name_prefix, "kx");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_queue_size: 4").unwrap();

        let config = ManagerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.max_queue_size, 4);
        // Missing fields fall back to defaults
        assert_eq!(config.thread_name_prefix, "kx");
    }

    #[test]
    fn test_from_file_rejects_zero_queue_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_queue_size: 0").unwrap();

        let err = ManagerConfig::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExecError>(),
            Some(ExecError::InvalidConfig(_))
        ));
    }
}
