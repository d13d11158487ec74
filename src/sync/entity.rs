//! Contract for records participating in sync.

use crate::sync::EntityKind;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Serialized name of the id field.
pub const ID_FIELD: &str = "id";
/// Serialized name of the owning user's id, also the realtime filter column.
pub const OWNER_FIELD: &str = "ownerId";
/// Serialized name of the last-modified field.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// A record type kept in sync between the device and the backend.
///
/// Serialized field names are camelCase. `LOCAL_FIELDS` lists the user-local preference fields
/// (by serialized name) that a merge keeps from the local snapshot; every other field except
/// `id` and `updatedAt` is server-authoritative.
pub trait SyncEntity:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;
    const LOCAL_FIELDS: &'static [&'static str];

    fn id(&self) -> &str;
    fn owner_id(&self) -> &str;
    /// Milliseconds since the Unix epoch.
    fn updated_at(&self) -> i64;
    fn set_updated_at(&mut self, updated_at: i64);

    fn is_active(&self) -> bool {
        true
    }
}

/// Content equality ignoring `updatedAt`
pub fn same_content<E: SyncEntity>(a: &E, b: &E) -> bool {
    if a.updated_at() == b.updated_at() {
        return a == b;
    }
    let mut b = b.clone();
    b.set_updated_at(a.updated_at());
    *a == b
}
