//! # Topology
//!
//! A [`Topology`] is the static graph of a stream processing application:
//! source nodes reading channels, processor nodes, sink nodes writing
//! channels, and the state stores connected to processors.
//!
//! Nodes are added parents first, so the graph is acyclic by construction.
//! Every mutation is checked immediately and fails with a [`GraphError`];
//! nothing runs until the topology is handed to a
//! [`Runtime`](crate::runtime::Runtime), which takes ownership of it.
//!
//! ```rust
//! use stateweave::codec::{JsonSerde, StringSerde};
//! use stateweave::processor::{CoGroupProcessor, CoGrouped};
//! use stateweave::state::Stores;
//! use stateweave::topology::Topology;
//!
//! type Tuple = CoGrouped<u32, String>;
//!
//! let mut topology = Topology::new();
//! topology
//!   .add_source("clicks", "clicks", StringSerde, JsonSerde::<u32>::new())?
//!   .add_source("purchases", "purchases", StringSerde, StringSerde)?
//!   .add_processor(
//!     "cogroup",
//!     || CoGroupProcessor::<String, u32, String>::new("tuples"),
//!     &["clicks", "purchases"],
//!   )?
//!   .add_state_store(
//!     Stores::key_value::<String, Tuple>("tuples", StringSerde, JsonSerde::new()).build(),
//!     &["cogroup"],
//!   )?
//!   .add_sink("out", "tuples-out", StringSerde, JsonSerde::<Tuple>::new(), &["cogroup"])?;
//!
//! println!("{}", topology.describe());
//! # Ok::<(), stateweave::error::GraphError>(())
//! ```

use crate::codec::{PayloadSerde, Serde, erase};
use crate::error::GraphError;
use crate::processor::{Processor, ProcessorSupplier};
use crate::state::StoreSpec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a node does.
#[derive(Clone)]
pub(crate) enum NodeKind {
  Source {
    channel: String,
    key_serde: Arc<dyn PayloadSerde>,
    value_serde: Arc<dyn PayloadSerde>,
  },
  Processor {
    supplier: ProcessorSupplier,
  },
  Sink {
    channel: String,
    key_serde: Arc<dyn PayloadSerde>,
    value_serde: Arc<dyn PayloadSerde>,
  },
}

/// A node declaration.
#[derive(Clone)]
pub(crate) struct NodeSpec {
  pub(crate) name: String,
  pub(crate) kind: NodeKind,
  pub(crate) parents: Vec<String>,
  pub(crate) children: Vec<String>,
  pub(crate) stores: Vec<String>,
}

impl NodeSpec {
  fn is_sink(&self) -> bool {
    matches!(self.kind, NodeKind::Sink { .. })
  }
}

/// The processing graph of an application.
#[derive(Clone, Default)]
pub struct Topology {
  nodes: Vec<NodeSpec>,
  index: HashMap<String, usize>,
  stores: Vec<Arc<StoreSpec>>,
  // channel -> source node consuming it
  subscriptions: HashMap<String, String>,
}

impl Topology {
  /// Creates an empty topology.
  pub fn new() -> Self {
    Self::default()
  }

  fn check_new_name(&self, name: &str) -> Result<(), GraphError> {
    if self.index.contains_key(name) {
      return Err(GraphError::DuplicateName(name.to_string()));
    }
    Ok(())
  }

  fn check_parents(&self, child: &str, parents: &[&str]) -> Result<(), GraphError> {
    if parents.is_empty() {
      return Err(GraphError::NoParents(child.to_string()));
    }
    for (i, parent) in parents.iter().enumerate() {
      if parents[..i].contains(parent) {
        return Err(GraphError::DuplicateParent {
          parent: parent.to_string(),
          child: child.to_string(),
        });
      }
      let idx = self
        .index
        .get(*parent)
        .ok_or_else(|| GraphError::UnknownNode(parent.to_string()))?;
      if self.nodes[*idx].is_sink() {
        return Err(GraphError::InvalidParent {
          parent: parent.to_string(),
          child: child.to_string(),
        });
      }
    }
    Ok(())
  }

  fn insert(&mut self, name: &str, kind: NodeKind, parents: &[&str]) {
    let idx = self.nodes.len();
    for parent in parents {
      if let Some(&p) = self.index.get(*parent) {
        self.nodes[p].children.push(name.to_string());
      }
    }
    self.nodes.push(NodeSpec {
      name: name.to_string(),
      kind,
      parents: parents.iter().map(|p| p.to_string()).collect(),
      children: Vec::new(),
      stores: Vec::new(),
    });
    self.index.insert(name.to_string(), idx);
  }

  /// Adds a source node reading `channel`, decoding keys and values with the
  /// given serdes.
  pub fn add_source<K, V>(
    &mut self,
    name: &str,
    channel: &str,
    key_serde: impl Serde<K> + 'static,
    value_serde: impl Serde<V> + 'static,
  ) -> Result<&mut Self, GraphError>
  where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
  {
    self.check_new_name(name)?;
    if let Some(existing) = self.subscriptions.get(channel) {
      return Err(GraphError::ChannelAlreadySubscribed {
        channel: channel.to_string(),
        source_node: existing.clone(),
      });
    }
    self.insert(
      name,
      NodeKind::Source {
        channel: channel.to_string(),
        key_serde: erase::<K, _>(key_serde),
        value_serde: erase::<V, _>(value_serde),
      },
      &[],
    );
    self
      .subscriptions
      .insert(channel.to_string(), name.to_string());
    Ok(self)
  }

  /// Adds a processor node fed by `parents`. `supplier` is called once per
  /// stream task to create the processor instance.
  pub fn add_processor<P, F>(
    &mut self,
    name: &str,
    supplier: F,
    parents: &[&str],
  ) -> Result<&mut Self, GraphError>
  where
    P: Processor + 'static,
    F: Fn() -> P + Send + Sync + 'static,
  {
    self.check_new_name(name)?;
    self.check_parents(name, parents)?;
    let supplier: ProcessorSupplier = Arc::new(move || Box::new(supplier()) as Box<dyn Processor>);
    self.insert(name, NodeKind::Processor { supplier }, parents);
    Ok(self)
  }

  /// Adds a sink node writing records from `parents` to `channel`.
  pub fn add_sink<K, V>(
    &mut self,
    name: &str,
    channel: &str,
    key_serde: impl Serde<K> + 'static,
    value_serde: impl Serde<V> + 'static,
    parents: &[&str],
  ) -> Result<&mut Self, GraphError>
  where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
  {
    self.check_new_name(name)?;
    self.check_parents(name, parents)?;
    self.insert(
      name,
      NodeKind::Sink {
        channel: channel.to_string(),
        key_serde: erase::<K, _>(key_serde),
        value_serde: erase::<V, _>(value_serde),
      },
      parents,
    );
    Ok(self)
  }

  /// Registers a state store and connects it to `processors`.
  pub fn add_state_store(
    &mut self,
    spec: StoreSpec,
    processors: &[&str],
  ) -> Result<&mut Self, GraphError> {
    if self.stores.iter().any(|s| s.name() == spec.name()) {
      return Err(GraphError::DuplicateStore(spec.name().to_string()));
    }
    for processor in processors {
      self.processor_index(spec.name(), processor)?;
    }
    let name = spec.name().to_string();
    self.stores.push(Arc::new(spec));
    for processor in processors {
      self.connect_processor_and_store(processor, &name)?;
    }
    Ok(self)
  }

  /// Connects an already registered store to a processor.
  pub fn connect_processor_and_store(
    &mut self,
    processor: &str,
    store: &str,
  ) -> Result<&mut Self, GraphError> {
    if !self.stores.iter().any(|s| s.name() == store) {
      return Err(GraphError::UnknownStore(store.to_string()));
    }
    let idx = self.processor_index(store, processor)?;
    let stores = &mut self.nodes[idx].stores;
    if !stores.iter().any(|s| s == store) {
      stores.push(store.to_string());
    }
    Ok(self)
  }

  fn processor_index(&self, store: &str, processor: &str) -> Result<usize, GraphError> {
    let idx = *self
      .index
      .get(processor)
      .ok_or_else(|| GraphError::UnknownNode(processor.to_string()))?;
    match self.nodes[idx].kind {
      NodeKind::Processor { .. } => Ok(idx),
      _ => Err(GraphError::StoreOnNonProcessor {
        store: store.to_string(),
        node: processor.to_string(),
      }),
    }
  }

  /// Node names in insertion order.
  pub fn node_names(&self) -> Vec<&str> {
    self.nodes.iter().map(|n| n.name.as_str()).collect()
  }

  /// Declared stores.
  pub fn stores(&self) -> &[Arc<StoreSpec>] {
    &self.stores
  }

  /// Channels read by sources, in insertion order.
  pub fn source_channels(&self) -> Vec<&str> {
    self
      .nodes
      .iter()
      .filter_map(|n| match &n.kind {
        NodeKind::Source { channel, .. } => Some(channel.as_str()),
        _ => None,
      })
      .collect()
  }

  /// Channels written by sinks, in insertion order.
  pub fn sink_channels(&self) -> Vec<&str> {
    self
      .nodes
      .iter()
      .filter_map(|n| match &n.kind {
        NodeKind::Sink { channel, .. } => Some(channel.as_str()),
        _ => None,
      })
      .collect()
  }

  pub(crate) fn nodes(&self) -> &[NodeSpec] {
    &self.nodes
  }

  /// Describes the topology, grouping nodes into connected sub-topologies.
  ///
  /// Two nodes belong to the same sub-topology if an edge or a shared store
  /// links them.
  pub fn describe(&self) -> TopologyDescription {
    let mut groups = UnionFind::new(self.nodes.len());
    for (i, node) in self.nodes.iter().enumerate() {
      for child in &node.children {
        if let Some(&c) = self.index.get(child) {
          groups.union(i, c);
        }
      }
    }
    let mut store_owner: HashMap<&str, usize> = HashMap::new();
    for (i, node) in self.nodes.iter().enumerate() {
      for store in &node.stores {
        match store_owner.get(store.as_str()) {
          Some(&owner) => groups.union(owner, i),
          None => {
            store_owner.insert(store, i);
          }
        }
      }
    }

    let mut order: Vec<usize> = Vec::new();
    let mut members: HashMap<usize, Vec<NodeDescription>> = HashMap::new();
    for (i, node) in self.nodes.iter().enumerate() {
      let root = groups.find(i);
      if !members.contains_key(&root) {
        order.push(root);
      }
      members.entry(root).or_default().push(NodeDescription {
        name: node.name.clone(),
        kind: match &node.kind {
          NodeKind::Source { channel, .. } => NodeType::Source {
            channel: channel.clone(),
          },
          NodeKind::Processor { .. } => NodeType::Processor {
            stores: node.stores.clone(),
          },
          NodeKind::Sink { channel, .. } => NodeType::Sink {
            channel: channel.clone(),
          },
        },
        predecessors: node.parents.clone(),
        successors: node.children.clone(),
      });
    }

    TopologyDescription {
      sub_topologies: order
        .into_iter()
        .enumerate()
        .map(|(id, root)| SubTopology {
          id,
          nodes: members.remove(&root).unwrap_or_default(),
        })
        .collect(),
      stores: self
        .stores
        .iter()
        .map(|s| StoreDescription {
          name: s.name().to_string(),
          persistent: s.persistent(),
          logged: s.logging_enabled(),
        })
        .collect(),
    }
  }
}

struct UnionFind {
  parent: Vec<usize>,
}

impl UnionFind {
  fn new(n: usize) -> Self {
    Self {
      parent: (0..n).collect(),
    }
  }

  fn find(&mut self, mut x: usize) -> usize {
    while self.parent[x] != x {
      self.parent[x] = self.parent[self.parent[x]];
      x = self.parent[x];
    }
    x
  }

  fn union(&mut self, a: usize, b: usize) {
    let (ra, rb) = (self.find(a), self.find(b));
    if ra != rb {
      // keep the earliest node as root so ids follow insertion order
      let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
      self.parent[hi] = lo;
    }
  }
}

/// Kind of a described node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeType {
  /// Reads a channel.
  Source {
    /// Input channel.
    channel: String,
  },
  /// Runs user logic.
  Processor {
    /// Connected stores.
    stores: Vec<String>,
  },
  /// Writes a channel.
  Sink {
    /// Output channel.
    channel: String,
  },
}

/// One node of a [`TopologyDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescription {
  /// Node name.
  pub name: String,
  /// Node kind.
  pub kind: NodeType,
  /// Parent nodes.
  pub predecessors: Vec<String>,
  /// Child nodes.
  pub successors: Vec<String>,
}

/// A connected group of nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTopology {
  /// Position of the group, by first node.
  pub id: usize,
  /// Nodes in insertion order.
  pub nodes: Vec<NodeDescription>,
}

/// A declared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescription {
  /// Store name.
  pub name: String,
  /// Kept on disk.
  pub persistent: bool,
  /// Backed by a change log.
  pub logged: bool,
}

/// Read-only description of a topology for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescription {
  /// Connected sub-topologies.
  pub sub_topologies: Vec<SubTopology>,
  /// Declared stores.
  pub stores: Vec<StoreDescription>,
}

impl TopologyDescription {
  /// Renders the topology as a Mermaid flowchart.
  ///
  /// Each sub-topology becomes a subgraph; stores are drawn as cylinders
  /// linked to their processors with dotted edges.
  #[must_use]
  pub fn to_mermaid(&self) -> String {
    let mut ids: HashMap<&str, String> = HashMap::new();
    let mut out = String::from("flowchart TD\n");
    for sub in &self.sub_topologies {
      out.push_str(&format!("  subgraph sub{}[\"Sub-topology {}\"]\n", sub.id, sub.id));
      for node in &sub.nodes {
        let id = format!("n{}", ids.len());
        ids.insert(node.name.as_str(), id.clone());
        let shape = match &node.kind {
          NodeType::Source { channel } => format!("{id}[/\"{}<br/>channel: {channel}\"/]", node.name),
          NodeType::Processor { .. } => format!("{id}[\"{}\"]", node.name),
          NodeType::Sink { channel } => format!("{id}[\\\"{}<br/>channel: {channel}\"\\]", node.name),
        };
        out.push_str(&format!("    {shape}\n"));
      }
      out.push_str("  end\n");
    }
    for sub in &self.sub_topologies {
      for node in &sub.nodes {
        for succ in &node.successors {
          if let (Some(from), Some(to)) = (ids.get(node.name.as_str()), ids.get(succ.as_str())) {
            out.push_str(&format!("  {from} --> {to}\n"));
          }
        }
      }
    }
    for (i, store) in self.stores.iter().enumerate() {
      out.push_str(&format!("  s{i}[(\"{}\")]\n", store.name));
      for sub in &self.sub_topologies {
        for node in &sub.nodes {
          if let NodeType::Processor { stores } = &node.kind {
            if stores.contains(&store.name) {
              if let Some(id) = ids.get(node.name.as_str()) {
                out.push_str(&format!("  {id} -.- s{i}\n"));
              }
            }
          }
        }
      }
    }
    out
  }
}

fn join(names: &[String]) -> String {
  if names.is_empty() {
    "none".to_string()
  } else {
    names.join(", ")
  }
}

impl fmt::Display for TopologyDescription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "Topologies:")?;
    for sub in &self.sub_topologies {
      writeln!(f, "   Sub-topology: {}", sub.id)?;
      for node in &sub.nodes {
        match &node.kind {
          NodeType::Source { channel } => {
            writeln!(f, "    Source: {} (channels: [{channel}])", node.name)?
          }
          NodeType::Processor { stores } => {
            writeln!(f, "    Processor: {} (stores: [{}])", node.name, stores.join(", "))?
          }
          NodeType::Sink { channel } => writeln!(f, "    Sink: {} (channel: {channel})", node.name)?,
        }
        if !node.successors.is_empty() {
          writeln!(f, "      --> {}", join(&node.successors))?;
        }
        if !node.predecessors.is_empty() {
          writeln!(f, "      <-- {}", join(&node.predecessors))?;
        }
      }
    }
    if !self.stores.is_empty() {
      writeln!(f, "Stores:")?;
      for store in &self.stores {
        writeln!(
          f,
          "    {} (persistent: {}, logged: {})",
          store.name, store.persistent, store.logged
        )?;
      }
    }
    Ok(())
  }
}

