use crate::Process;
use procloop_core::Supervisor;
use tracing::debug;

/// Spawn backend selected at compile time
#[cfg(unix)]
pub type PlatformSpawner = procloop_unix::UnixSpawner;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformSpawnerFactory;

impl PlatformSpawnerFactory {
    pub fn create_spawner() -> PlatformSpawner {
        #[cfg(unix)]
        {
            debug!("Creating Unix spawner");
            procloop_unix::UnixSpawnerFactory::create_spawner()
        }
    }

    /// Create a process supervisor backed by this platform's spawner
    pub fn create_process() -> Process {
        Supervisor::with_spawner(Self::create_spawner())
    }

    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        {
            procloop_unix::UnixSpawnerFactory::platform_name()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_name() {
        assert_eq!(PlatformSpawnerFactory::platform_name(), "Unix");
    }

    #[test]
    fn test_created_processes_are_distinct() {
        let first = PlatformSpawnerFactory::create_process();
        let second = PlatformSpawnerFactory::create_process();
        assert_ne!(first.id(), second.id());
        assert!(!first.ptr_eq(&second));
        assert!(first.ptr_eq(&first.clone()));
    }
}
