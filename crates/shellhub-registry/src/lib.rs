//! Registry over devices, namespaces, members, tags, public keys and
//! sessions. The persistent backend is a collaborator; [`MemoryStore`] is
//! the complete reference implementation the gateway mounts.

mod error;
mod memory;
mod model;
mod store;

pub use error::RegistryError;
pub use memory::MemoryStore;
pub use model::*;
pub use store::{
    AcceptabilityMode, DeviceAuthInput, DeviceListQuery, DeviceSortBy, PublicKeyInput, SessionInput, SortOrder, Store,
};
