//! Message type registry.
//!
//! Maps wire type names to registered Rust types, holds the per-type erased
//! payload codecs (the message provider), and answers assignability between
//! a resolved type and a subscriber's declared type against the
//! user-declared type graph. Lookups are cached; the registry is
//! process-wide and safe under concurrent readers and writers.

use std::any::TypeId;
use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};

use crate::AnyMessage;
use crate::serializer::PayloadCodec;

/// Deserializes a payload into the registered type, erased.
pub type ErasedDecoder = Arc<dyn Fn(&PayloadCodec, &[u8]) -> Result<AnyMessage> + Send + Sync>;

/// Serializes a message object of the registered type, erased.
pub type ErasedEncoder = Arc<dyn Fn(&PayloadCodec, &AnyMessage) -> Result<Bytes> + Send + Sync>;

/// Converts a message object to a declared supertype along a `relate_with`
/// edge. Returns `None` when the object is not of the edge's source type.
type Caster = Arc<dyn Fn(&AnyMessage) -> Option<AnyMessage> + Send + Sync>;

/// Chooses the wire name for a registered type from its Rust type path.
pub type TypeNameResolver = Arc<dyn Fn(&'static str) -> String + Send + Sync>;

pub struct MessageTypeEntry {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub wire_name: String,
    pub(crate) decode: ErasedDecoder,
    pub(crate) encode: ErasedEncoder,
}

impl std::fmt::Debug for MessageTypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTypeEntry")
            .field("type_name", &self.type_name)
            .field("wire_name", &self.wire_name)
            .finish()
    }
}

#[derive(Clone)]
struct Edge {
    to: TypeId,
    caster: Option<Caster>,
}

#[derive(Clone)]
enum Assignability {
    No,
    /// Assignable; `None` means the original object is passed through
    /// unchanged (identity, or an edge without a converter).
    Yes(Option<Caster>),
}

pub struct TypeRegistry {
    resolver: TypeNameResolver,
    types: DashMap<TypeId, Arc<MessageTypeEntry>>,
    by_wire_name: DashMap<String, TypeId>,
    edges: DashMap<TypeId, Vec<Edge>>,
    assignability: DashMap<(TypeId, TypeId), Assignability>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Registry with the default resolver: the fully qualified Rust type
    /// path becomes the wire name.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(|type_name| type_name.to_string()))
    }

    pub fn with_resolver(resolver: TypeNameResolver) -> Self {
        Self {
            resolver,
            types: DashMap::new(),
            by_wire_name: DashMap::new(),
            edges: DashMap::new(),
            assignability: DashMap::new(),
        }
    }

    /// Register a message type under the resolver-chosen wire name.
    pub fn register<T>(&self) -> Arc<MessageTypeEntry>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let wire_name = (self.resolver)(std::any::type_name::<T>());
        self.register_named::<T>(wire_name)
    }

    /// Register a message type under an explicit wire name.
    pub fn register_named<T>(&self, wire_name: impl Into<String>) -> Arc<MessageTypeEntry>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        let wire_name = wire_name.into();

        let decode: ErasedDecoder = Arc::new(|codec: &PayloadCodec, bytes: &[u8]| {
            let value: T = codec.decode(bytes)?;
            Ok(Arc::new(value) as AnyMessage)
        });
        let encode: ErasedEncoder = Arc::new(move |codec: &PayloadCodec, message: &AnyMessage| {
            let value = message
                .downcast_ref::<T>()
                .ok_or_else(|| anyhow::anyhow!("message object is not a {type_name}"))?;
            codec.encode(value)
        });

        let entry = Arc::new(MessageTypeEntry {
            type_id,
            type_name,
            wire_name: wire_name.clone(),
            decode,
            encode,
        });
        self.by_wire_name.insert(wire_name, type_id);
        self.types.insert(type_id, entry.clone());
        entry
    }

    /// Declare that `Sub` is assignable to `Super` without a converter; a
    /// subscriber declared on `Super` receives the original object.
    pub fn relate<Sub: 'static, Super: 'static>(&self) {
        self.add_edge(TypeId::of::<Sub>(), TypeId::of::<Super>(), None);
    }

    /// Declare that `Sub` is assignable to `Super` with a converter; a
    /// subscriber declared on `Super` receives the converted value.
    pub fn relate_with<Sub, Super>(&self, upcast: fn(&Sub) -> Super)
    where
        Sub: Send + Sync + 'static,
        Super: Send + Sync + 'static,
    {
        let caster: Caster = Arc::new(move |message: &AnyMessage| {
            message
                .downcast_ref::<Sub>()
                .map(|sub| Arc::new(upcast(sub)) as AnyMessage)
        });
        self.add_edge(TypeId::of::<Sub>(), TypeId::of::<Super>(), Some(caster));
    }

    fn add_edge(&self, from: TypeId, to: TypeId, caster: Option<Caster>) {
        self.edges.entry(from).or_default().push(Edge { to, caster });
        // The graph changed under any cached answers.
        self.assignability.clear();
    }

    pub fn entry(&self, type_id: TypeId) -> Option<Arc<MessageTypeEntry>> {
        self.types.get(&type_id).map(|e| e.clone())
    }

    pub fn entry_of<T: 'static>(&self) -> Option<Arc<MessageTypeEntry>> {
        self.entry(TypeId::of::<T>())
    }

    pub fn resolve_wire_name(&self, wire_name: &str) -> Option<TypeId> {
        self.by_wire_name.get(wire_name).map(|id| *id)
    }

    pub fn wire_name(&self, type_id: TypeId) -> Option<String> {
        self.entry(type_id).map(|e| e.wire_name.clone())
    }

    /// Capability predicate: is a message of `resolved` type deliverable to
    /// a subscriber declared on `declared`?
    pub fn is_assignable(&self, resolved: TypeId, declared: TypeId) -> bool {
        !matches!(self.lookup(resolved, declared), Assignability::No)
    }

    /// Produce the object a subscriber declared on `declared` should
    /// receive for a message of `resolved` type. `None` when not
    /// assignable; without a converter chain the original object is passed
    /// through unchanged.
    pub fn coerce(
        &self,
        message: &AnyMessage,
        resolved: TypeId,
        declared: TypeId,
    ) -> Option<AnyMessage> {
        match self.lookup(resolved, declared) {
            Assignability::No => None,
            Assignability::Yes(None) => Some(message.clone()),
            Assignability::Yes(Some(caster)) => caster(message).or_else(|| Some(message.clone())),
        }
    }

    fn lookup(&self, resolved: TypeId, declared: TypeId) -> Assignability {
        if let Some(cached) = self.assignability.get(&(resolved, declared)) {
            return cached.clone();
        }
        let computed = self.search(resolved, declared);
        self.assignability
            .insert((resolved, declared), computed.clone());
        computed
    }

    /// Breadth-first walk over the declared edges, composing converters. A
    /// path with any converter-less hop degrades to pass-through.
    fn search(&self, resolved: TypeId, declared: TypeId) -> Assignability {
        if resolved == declared {
            return Assignability::Yes(None);
        }
        let mut visited = vec![resolved];
        let mut queue: VecDeque<(TypeId, Option<Caster>)> = VecDeque::new();
        queue.push_back((resolved, None));

        while let Some((current, composed)) = queue.pop_front() {
            let Some(edges) = self.edges.get(&current) else {
                continue;
            };
            for edge in edges.iter() {
                if visited.contains(&edge.to) {
                    continue;
                }
                let next = match (&composed, &edge.caster, current == resolved) {
                    // First hop: the edge's converter applies directly.
                    (None, Some(caster), true) => Some(caster.clone()),
                    (Some(prev), Some(caster), _) => {
                        let prev = prev.clone();
                        let caster = caster.clone();
                        Some(Arc::new(move |message: &AnyMessage| {
                            prev(message).and_then(|mid| caster(&mid))
                        }) as Caster)
                    }
                    // A hop without a converter breaks the chain.
                    _ => None,
                };
                if edge.to == declared {
                    return Assignability::Yes(next);
                }
                visited.push(edge.to);
                queue.push_back((edge.to, next));
            }
        }
        Assignability::No
    }
}
