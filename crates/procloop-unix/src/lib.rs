#[cfg(unix)]
mod unix_spawner;

#[cfg(unix)]
pub use unix_spawner::{UnixChild, UnixSpawner};

#[cfg(unix)]
pub struct UnixSpawnerFactory;

#[cfg(unix)]
impl UnixSpawnerFactory {
    pub fn create_spawner() -> UnixSpawner {
        UnixSpawner
    }

    pub fn platform_name() -> &'static str {
        <UnixSpawner as procloop_core::ProcessSpawner>::platform_name()
    }
}
