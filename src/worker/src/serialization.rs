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

//! Per-driver serialization registries.
//!
//! Values flowing through the object store are dynamically typed
//! ([`DynValue`]); each driver owns a [`SerializationContext`] mapping the
//! runtime type to a codec. Codecs come in three strategies: *structural*
//! (the value as a named bag of fields, via JSON), *opaque* (an opaque
//! binary blob, via bincode) and *custom* (user supplied). Stored bytes are
//! self-describing: a 20-byte class id followed by the codec payload.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use photon_common::failure::TaskFailure;
use photon_common::ids::{ClassId, DriverId, ObjectId, ID_SIZE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A dynamically typed value travelling through the object store.
pub type DynValue = Box<dyn Any + Send + Sync>;

/// Inline argument values larger than this are spilled to the object store.
pub const SIMPLE_VALUE_MAX_LEN: usize = 100;

pub type SerResult<T> = std::result::Result<T, SerError>;

#[derive(Error, Debug)]
pub enum SerError {
    /// The value's type has no codec in the caller's context yet.
    #[error("no codec registered for type `{0}`")]
    CodecMissing(&'static str),

    /// The stored class id has no codec in this context yet; the import
    /// subscription may still deliver it.
    #[error("no codec imported yet for class {0}")]
    ClassMissing(ClassId),

    #[error("failed to encode value of type `{type_name}`: {source}")]
    Encode {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The stored bytes cannot be decoded. This is a hard error: retrying
    /// will not help.
    #[error("stored bytes for class {class_id} are invalid: {source}")]
    Decode {
        class_id: ClassId,
        #[source]
        source: anyhow::Error,
    },

    #[error("stored object header is truncated")]
    TruncatedHeader,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecStrategy {
    Structural,
    Opaque,
    Custom,
}

impl CodecStrategy {
    fn tag(self) -> &'static str {
        match self {
            CodecStrategy::Structural => "structural",
            CodecStrategy::Opaque => "opaque",
            CodecStrategy::Custom => "custom",
        }
    }
}

type SerializeFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> SerResult<Vec<u8>> + Send + Sync>;
type DeserializeFn = Box<dyn Fn(&[u8]) -> SerResult<DynValue> + Send + Sync>;

pub struct Codec {
    pub class_id: ClassId,
    pub type_name: &'static str,
    pub strategy: CodecStrategy,
    /// Local-only codecs are never exported to other workers.
    pub local_only: bool,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
    type_id: TypeId,
}

impl Codec {
    pub fn serialize(&self, value: &(dyn Any + Send + Sync)) -> SerResult<Vec<u8>> {
        (self.serialize)(value)
    }

    pub fn deserialize(&self, payload: &[u8]) -> SerResult<DynValue> {
        (self.deserialize)(payload)
    }
}

/// The class descriptor whose encoding is hashed into a class id.
#[derive(Serialize, Deserialize, PartialEq)]
struct ClassDescriptor {
    type_name: String,
    strategy: String,
}

/// Compute a class id all workers agree on by driving the descriptor's
/// encoding to a serialize/deserialize/serialize fixed point, bounded by
/// `rounds`. On non-convergence the last hash is used and workers may
/// disagree.
pub fn compute_class_id(type_name: &str, strategy: CodecStrategy, rounds: usize) -> ClassId {
    let descriptor = ClassDescriptor {
        type_name: type_name.to_owned(),
        strategy: strategy.tag().to_owned(),
    };
    let mut bytes = match bincode::serialize(&descriptor) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(type_name, error = %e, "failed to encode class descriptor");
            return ClassId::from_digest_of(type_name.as_bytes());
        }
    };
    for _ in 0..rounds {
        let roundtrip: ClassDescriptor = match bincode::deserialize(&bytes) {
            Ok(descriptor) => descriptor,
            Err(_) => break,
        };
        match bincode::serialize(&roundtrip) {
            Ok(new_bytes) if new_bytes == bytes => return ClassId::from_digest_of(&bytes),
            Ok(new_bytes) => bytes = new_bytes,
            Err(_) => break,
        }
    }
    tracing::warn!(
        type_name,
        "could not produce a deterministic class id; workers may disagree"
    );
    ClassId::from_digest_of(&bytes)
}

struct ContextInner {
    by_type: HashMap<TypeId, Arc<Codec>>,
    by_class: HashMap<ClassId, Arc<Codec>>,
}

/// Codec registry of one driver. Contexts are never shared across drivers.
pub struct SerializationContext {
    driver_id: DriverId,
    fixed_point_rounds: usize,
    inner: RwLock<ContextInner>,
}

impl SerializationContext {
    pub fn new(driver_id: DriverId, fixed_point_rounds: usize) -> Self {
        let ctx = Self {
            driver_id,
            fixed_point_rounds,
            inner: RwLock::new(ContextInner {
                by_type: HashMap::new(),
                by_class: HashMap::new(),
            }),
        };
        ctx.register_builtins();
        ctx
    }

    pub fn driver_id(&self) -> DriverId {
        self.driver_id
    }

    /// Encode a value into its self-describing stored form.
    pub fn serialize(&self, value: &(dyn Any + Send + Sync)) -> SerResult<Vec<u8>> {
        let codec = self
            .inner
            .read()
            .by_type
            .get(&value.type_id())
            .cloned()
            .ok_or(SerError::CodecMissing("<unregistered>"))?;
        let payload = codec.serialize(value)?;
        let mut bytes = Vec::with_capacity(ID_SIZE + payload.len());
        bytes.extend_from_slice(codec.class_id.as_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode a stored object.
    pub fn deserialize(&self, bytes: &[u8]) -> SerResult<DynValue> {
        if bytes.len() < ID_SIZE {
            return Err(SerError::TruncatedHeader);
        }
        let (header, payload) = bytes.split_at(ID_SIZE);
        let class_id = ClassId::try_from(header).map_err(|_| SerError::TruncatedHeader)?;
        let codec = self
            .inner
            .read()
            .by_class
            .get(&class_id)
            .cloned()
            .ok_or(SerError::ClassMissing(class_id))?;
        codec.deserialize(payload)
    }

    pub fn has_codec_for<T: 'static>(&self) -> bool {
        self.inner.read().by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn codec_for_type_id(&self, type_id: TypeId) -> Option<Arc<Codec>> {
        self.inner.read().by_type.get(&type_id).cloned()
    }

    pub fn install(&self, codec: Arc<Codec>) {
        let mut inner = self.inner.write();
        inner.by_type.insert(codec.type_id, codec.clone());
        inner.by_class.insert(codec.class_id, codec);
    }

    pub fn register_structural<T>(&self) -> Arc<Codec>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let codec = Arc::new(structural_codec::<T>(self.fixed_point_rounds, false));
        self.install(codec.clone());
        codec
    }

    pub fn register_opaque<T>(&self, local_only: bool) -> Arc<Codec>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let codec = Arc::new(opaque_codec::<T>(self.fixed_point_rounds, local_only));
        self.install(codec.clone());
        codec
    }

    pub fn register_custom<T, S, D>(&self, serialize: S, deserialize: D, local_only: bool) -> Arc<Codec>
    where
        T: Send + Sync + 'static,
        S: Fn(&T) -> SerResult<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> SerResult<T> + Send + Sync + 'static,
    {
        let codec = Arc::new(custom_codec::<T, S, D>(
            serialize,
            deserialize,
            self.fixed_point_rounds,
            local_only,
        ));
        self.install(codec.clone());
        codec
    }

    fn register_builtins(&self) {
        macro_rules! register_primitives {
            ($($ty:ty),* $(,)?) => {
                $(self.register_opaque::<$ty>(false);)*
            };
        }
        register_primitives!(
            (),
            bool,
            i8,
            i16,
            i32,
            i64,
            u8,
            u16,
            u32,
            u64,
            f32,
            f64,
            String,
            Vec<u8>,
        );
        self.register_structural::<TaskFailure>();
        // Object ids are stored as their raw 20 bytes.
        self.register_custom::<ObjectId, _, _>(
            |id| Ok(id.as_bytes().to_vec()),
            |bytes| {
                ObjectId::try_from(bytes).map_err(|e| SerError::Decode {
                    class_id: ClassId::nil(),
                    source: e.into(),
                })
            },
            false,
        );
    }
}

pub fn structural_codec<T>(rounds: usize, local_only: bool) -> Codec
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let type_name = std::any::type_name::<T>();
    let class_id = compute_class_id(type_name, CodecStrategy::Structural, rounds);
    Codec {
        class_id,
        type_name,
        strategy: CodecStrategy::Structural,
        local_only,
        serialize: Box::new(move |value| {
            let value = downcast::<T>(value)?;
            serde_json::to_vec(value).map_err(|e| SerError::Encode {
                type_name,
                source: e.into(),
            })
        }),
        deserialize: Box::new(move |payload| {
            let value: T = serde_json::from_slice(payload).map_err(|e| SerError::Decode {
                class_id,
                source: e.into(),
            })?;
            Ok(Box::new(value))
        }),
        type_id: TypeId::of::<T>(),
    }
}

pub fn opaque_codec<T>(rounds: usize, local_only: bool) -> Codec
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let type_name = std::any::type_name::<T>();
    let class_id = compute_class_id(type_name, CodecStrategy::Opaque, rounds);
    Codec {
        class_id,
        type_name,
        strategy: CodecStrategy::Opaque,
        local_only,
        serialize: Box::new(move |value| {
            let value = downcast::<T>(value)?;
            bincode::serialize(value).map_err(|e| SerError::Encode {
                type_name,
                source: e.into(),
            })
        }),
        deserialize: Box::new(move |payload| {
            let value: T = bincode::deserialize(payload).map_err(|e| SerError::Decode {
                class_id,
                source: e.into(),
            })?;
            Ok(Box::new(value))
        }),
        type_id: TypeId::of::<T>(),
    }
}

pub fn custom_codec<T, S, D>(serialize: S, deserialize: D, rounds: usize, local_only: bool) -> Codec
where
    T: Send + Sync + 'static,
    S: Fn(&T) -> SerResult<Vec<u8>> + Send + Sync + 'static,
    D: Fn(&[u8]) -> SerResult<T> + Send + Sync + 'static,
{
    let type_name = std::any::type_name::<T>();
    let class_id = compute_class_id(type_name, CodecStrategy::Custom, rounds);
    Codec {
        class_id,
        type_name,
        strategy: CodecStrategy::Custom,
        local_only,
        serialize: Box::new(move |value| serialize(downcast::<T>(value)?)),
        deserialize: Box::new(move |payload| Ok(Box::new(deserialize(payload)?) as DynValue)),
        type_id: TypeId::of::<T>(),
    }
}

fn downcast<T: 'static>(value: &(dyn Any + Send + Sync)) -> SerResult<&T> {
    value
        .downcast_ref::<T>()
        .ok_or(SerError::CodecMissing(std::any::type_name::<T>()))
}

/// Per-driver contexts of one worker process.
pub struct SerializationRegistry {
    fixed_point_rounds: usize,
    contexts: Mutex<HashMap<DriverId, Arc<SerializationContext>>>,
}

impl SerializationRegistry {
    pub fn new(fixed_point_rounds: usize) -> Self {
        Self {
            fixed_point_rounds,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// The context of `driver_id`, created on first use.
    pub fn context(&self, driver_id: DriverId) -> Arc<SerializationContext> {
        self.contexts
            .lock()
            .entry(driver_id)
            .or_insert_with(|| {
                Arc::new(SerializationContext::new(driver_id, self.fixed_point_rounds))
            })
            .clone()
    }

    pub fn remove(&self, driver_id: DriverId) {
        self.contexts.lock().remove(&driver_id);
    }
}

/// Whether an inline argument may ship with the task instead of being
/// spilled to the object store: scalars, short strings and short byte
/// strings qualify.
pub fn is_simple_value(value: &(dyn Any + Send + Sync)) -> bool {
    let type_id = value.type_id();
    if [
        TypeId::of::<()>(),
        TypeId::of::<bool>(),
        TypeId::of::<i8>(),
        TypeId::of::<i16>(),
        TypeId::of::<i32>(),
        TypeId::of::<i64>(),
        TypeId::of::<u8>(),
        TypeId::of::<u16>(),
        TypeId::of::<u32>(),
        TypeId::of::<u64>(),
        TypeId::of::<f32>(),
        TypeId::of::<f64>(),
    ]
    .contains(&type_id)
    {
        return true;
    }
    if let Some(s) = value.downcast_ref::<String>() {
        return s.len() <= SIMPLE_VALUE_MAX_LEN;
    }
    if let Some(b) = value.downcast_ref::<Vec<u8>>() {
        return b.len() <= SIMPLE_VALUE_MAX_LEN;
    }
    false
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn context() -> SerializationContext {
        SerializationContext::new(DriverId::random(), 5)
    }

    #[test]
    fn builtin_roundtrip() {
        let ctx = context();
        let bytes = ctx.serialize(&(42i64) as &(dyn Any + Send + Sync)).unwrap();
        let value = ctx.deserialize(&bytes).unwrap();
        assert_eq!(*value.downcast_ref::<i64>().unwrap(), 42);
    }

    #[test]
    fn string_roundtrip() {
        let ctx = context();
        let original = "hello".to_owned();
        let bytes = ctx.serialize(&original as &(dyn Any + Send + Sync)).unwrap();
        let value = ctx.deserialize(&bytes).unwrap();
        assert_eq!(value.downcast_ref::<String>().unwrap(), "hello");
    }

    #[test]
    fn unregistered_type_reports_codec_missing() {
        struct Opaque;
        let ctx = context();
        let result = ctx.serialize(&Opaque as &(dyn Any + Send + Sync));
        assert!(matches!(result, Err(SerError::CodecMissing(_))));
    }

    #[test]
    fn unknown_class_reports_class_missing() {
        let sender = context();
        let receiver = context();

        #[derive(Serialize, Deserialize)]
        struct Custom {
            x: u32,
        }
        sender.register_structural::<Custom>();
        let bytes = sender
            .serialize(&Custom { x: 7 } as &(dyn Any + Send + Sync))
            .unwrap();
        assert!(matches!(
            receiver.deserialize(&bytes),
            Err(SerError::ClassMissing(_))
        ));

        // After the import installs the codec, decoding succeeds.
        receiver.register_structural::<Custom>();
        let value = receiver.deserialize(&bytes).unwrap();
        assert_eq!(value.downcast_ref::<Custom>().unwrap().x, 7);
    }

    #[test]
    fn garbage_bytes_are_a_hard_error() {
        let ctx = context();
        assert!(matches!(
            ctx.deserialize(&[1, 2, 3]),
            Err(SerError::TruncatedHeader)
        ));

        // A valid header for a registered class with a corrupt payload.
        let valid = ctx.serialize(&(1i64) as &(dyn Any + Send + Sync)).unwrap();
        let mut corrupt = valid[..ID_SIZE].to_vec();
        corrupt.extend_from_slice(b"\x01");
        assert!(matches!(
            ctx.deserialize(&corrupt),
            Err(SerError::Decode { .. })
        ));
    }

    #[test]
    fn class_ids_are_deterministic_across_contexts() {
        assert_eq!(
            compute_class_id("some::Type", CodecStrategy::Structural, 5),
            compute_class_id("some::Type", CodecStrategy::Structural, 5)
        );
        assert_ne!(
            compute_class_id("some::Type", CodecStrategy::Structural, 5),
            compute_class_id("some::Type", CodecStrategy::Opaque, 5)
        );
    }

    #[test]
    fn simple_value_predicate() {
        assert!(is_simple_value(&(1i64) as &(dyn Any + Send + Sync)));
        assert!(is_simple_value(&(true) as &(dyn Any + Send + Sync)));
        assert!(is_simple_value(&("short".to_owned()) as &(dyn Any + Send + Sync)));
        let long = "x".repeat(SIMPLE_VALUE_MAX_LEN + 1);
        assert!(!is_simple_value(&long as &(dyn Any + Send + Sync)));
        assert!(!is_simple_value(&(vec![0u8; 200]) as &(dyn Any + Send + Sync)));
    }

    #[test]
    fn contexts_are_per_driver() {
        let registry = SerializationRegistry::new(5);
        let a = registry.context(DriverId::random());
        let b = registry.context(DriverId::random());
        assert_ne!(a.driver_id(), b.driver_id());

        #[derive(Serialize, Deserialize)]
        struct OnlyInA;
        a.register_opaque::<OnlyInA>(false);
        assert!(a.has_codec_for::<OnlyInA>());
        assert!(!b.has_codec_for::<OnlyInA>());
    }
}
