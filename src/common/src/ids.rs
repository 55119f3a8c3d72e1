// Copyright 2024 Photon Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The identifier space of the cluster.
//!
//! Every entity is addressed by a 20-byte opaque id. The distinguished NIL
//! value is 20 bytes of `0xff`. Object ids for task returns and driver puts
//! are derived deterministically from the owning task id so that retries of
//! the same task produce the same ids.

use std::fmt;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Width in bytes of every id in the system.
pub const ID_SIZE: usize = 20;

// The sha1-based derivations below assume the digest width matches.
static_assertions::const_assert_eq!(ID_SIZE, 20);

const NIL_BYTES: [u8; ID_SIZE] = [0xff; ID_SIZE];

/// Error for byte slices that are not exactly [`ID_SIZE`] bytes long.
#[derive(Debug, thiserror::Error)]
#[error("invalid id length {0}, expected {ID_SIZE}")]
pub struct InvalidIdLength(pub usize);

macro_rules! def_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; ID_SIZE]);

        impl $name {
            /// The distinguished NIL value, 20 bytes of `0xff`.
            pub const fn nil() -> Self {
                Self(NIL_BYTES)
            }

            pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn is_nil(&self) -> bool {
                self.0 == NIL_BYTES
            }

            /// A fresh id from the thread-local RNG.
            pub fn random() -> Self {
                let mut bytes = [0u8; ID_SIZE];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            pub fn into_bytes(self) -> [u8; ID_SIZE] {
                self.0
            }

            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let bytes: [u8; ID_SIZE] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl From<[u8; ID_SIZE]> for $name {
            fn from(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = InvalidIdLength;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let bytes: [u8; ID_SIZE] =
                    bytes.try_into().map_err(|_| InvalidIdLength(bytes.len()))?;
                Ok(Self(bytes))
            }
        }
    };
}

def_id! {
    /// Address of a value in the object store.
    ObjectId
}
def_id! {
    /// Identity of a submitted task, derived from its parent.
    TaskId
}
def_id! {
    /// Identity of a driver session. Equal to the driver's worker id.
    DriverId
}
def_id! {
    /// Identity of an actor instance.
    ActorId
}
def_id! {
    /// Identity of one handle onto an actor; several handles may point at
    /// the same actor.
    ActorHandleId
}
def_id! {
    /// Identity of a raylet client connection.
    ClientId
}
def_id! {
    /// Identity of a worker process.
    WorkerId
}
def_id! {
    /// Content-addressed identity of a remote function or actor method.
    FunctionId
}
def_id! {
    /// Stable identity of a registered serialization codec.
    ClassId
}

impl From<WorkerId> for DriverId {
    fn from(id: WorkerId) -> Self {
        DriverId(id.0)
    }
}

impl From<DriverId> for WorkerId {
    fn from(id: DriverId) -> Self {
        WorkerId(id.0)
    }
}

fn sha1_id(parts: &[&[u8]]) -> [u8; ID_SIZE] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

impl ObjectId {
    /// The object id of the `return_index`-th return value (1-based) of the
    /// given task.
    pub fn for_return(task_id: TaskId, return_index: i32) -> Self {
        assert!(return_index >= 1, "return indices are 1-based");
        Self::with_index(task_id, return_index)
    }

    /// The object id of the `put_index`-th `put` (1-based) performed while
    /// the given task is current. Put indices occupy the negative half of
    /// the index space, so puts never collide with returns.
    pub fn for_put(task_id: TaskId, put_index: i32) -> Self {
        assert!(put_index >= 1, "put indices are 1-based");
        Self::with_index(task_id, -put_index)
    }

    fn with_index(task_id: TaskId, index: i32) -> Self {
        let mut bytes = task_id.into_bytes();
        bytes[ID_SIZE - 4..].copy_from_slice(&index.to_le_bytes());
        Self(bytes)
    }
}

impl TaskId {
    /// Derive the id of the `child_index`-th task submitted while this task
    /// is current. The derivation is a content hash, so re-submission after
    /// a retry reproduces identical child ids.
    pub fn for_child(parent: TaskId, child_index: u64) -> Self {
        Self(sha1_id(&[parent.as_bytes(), &child_index.to_le_bytes()]))
    }

    /// The deterministic driver task id for a fixed `object_id_seed`.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut bytes = [0u8; ID_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl FunctionId {
    pub fn from_parts(
        driver_id: DriverId,
        module_name: &str,
        class_name: &str,
        function_name: &str,
    ) -> Self {
        Self(sha1_id(&[
            driver_id.as_bytes(),
            module_name.as_bytes(),
            class_name.as_bytes(),
            function_name.as_bytes(),
        ]))
    }
}

impl ClassId {
    pub fn from_digest_of(bytes: &[u8]) -> Self {
        Self(sha1_id(&[bytes]))
    }
}

impl ActorHandleId {
    /// Derive the id of a handle forked from `parent` at fork position
    /// `fork_index`. Deserializing a serialized handle forks it, so two
    /// holders of a copied handle never share a handle id.
    pub fn for_fork(parent: ActorHandleId, fork_index: u64) -> Self {
        Self(sha1_id(&[parent.as_bytes(), &fork_index.to_le_bytes()]))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn nil_roundtrip() {
        assert!(ObjectId::nil().is_nil());
        assert!(!ObjectId::random().is_nil());
        assert_eq!(TaskId::nil().hex(), "ff".repeat(ID_SIZE));
    }

    #[test]
    fn hex_roundtrip() {
        let id = ObjectId::random();
        assert_eq!(ObjectId::from_hex(&id.hex()).unwrap(), id);
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn derived_object_ids_are_unique() {
        let task = TaskId::random();
        let mut seen = HashSet::new();
        for i in 1..=100 {
            assert!(seen.insert(ObjectId::for_return(task, i)));
            assert!(seen.insert(ObjectId::for_put(task, i)));
        }
        // A different task yields a disjoint id set.
        let other = TaskId::random();
        for i in 1..=100 {
            assert!(seen.insert(ObjectId::for_return(other, i)));
        }
    }

    #[test]
    fn derived_object_ids_are_deterministic() {
        let task = TaskId::from_seed(7);
        assert_eq!(ObjectId::for_return(task, 3), ObjectId::for_return(task, 3));
        assert_eq!(ObjectId::for_put(task, 3), ObjectId::for_put(task, 3));
        assert_ne!(ObjectId::for_return(task, 3), ObjectId::for_put(task, 3));
    }

    #[test]
    fn seeded_task_ids_are_stable() {
        assert_eq!(TaskId::from_seed(42), TaskId::from_seed(42));
        assert_ne!(TaskId::from_seed(42), TaskId::from_seed(43));
    }

    #[test]
    fn child_task_ids_depend_on_index() {
        let parent = TaskId::random();
        assert_eq!(TaskId::for_child(parent, 0), TaskId::for_child(parent, 0));
        assert_ne!(TaskId::for_child(parent, 0), TaskId::for_child(parent, 1));
    }
}
