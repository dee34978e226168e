pub mod adapter;
pub mod error;
pub mod interaction;
pub mod registry;
pub mod store;
pub mod stub;
pub mod tasks;

pub use adapter::{
    AdapterHandle, AdapterSpawner, InputTurn, ProcessSpawner, SpawnMode, SpawnOptions,
};
pub use error::AmuxError;
pub use interaction::{DEFAULT_INTERACTION_TIMEOUT, InteractionCoordinator};
pub use registry::{ConnectionSender, OpenInteraction, SessionRegistry};
pub use store::FsStore;
pub use stub::ScriptedSpawner;
pub use tasks::{DEFAULT_POLL_INTERVAL, TaskManager};
