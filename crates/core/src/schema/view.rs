//! Browsable tree over the flat key -> descriptor store
//!
//! The registry fills a [`SchemaStore`] with every descriptor its sources
//! declare. A [`SchemaView`] presents one level of that key space at a time
//! and answers partial (possibly wildcarded) lookups. Child listings are
//! built on first use and cached per node until [`SchemaStore::refresh`].

use skyboard_types::{key::WILDCARD, CategoryKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use super::descriptor::FieldDescriptor;
use crate::error::SchemaError;

/// Materialized children of one view node, next segment -> child prefix
#[derive(Debug, Default)]
struct ViewNode {
    children: BTreeMap<String, CategoryKey>,
}

/// Flat store of resolved descriptors shared by every view
#[derive(Default)]
pub struct SchemaStore {
    descriptors: RwLock<BTreeMap<CategoryKey, Arc<FieldDescriptor>>>,
    views: RwLock<HashMap<CategoryKey, Arc<ViewNode>>>,
}

impl SchemaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a descriptor. The first declaration of a key wins. Views are not
    /// invalidated until [`SchemaStore::refresh`].
    pub fn insert(&self, descriptor: Arc<FieldDescriptor>) -> bool {
        let mut descriptors = self.descriptors.write().unwrap_or_else(|e| e.into_inner());
        if descriptors.contains_key(&descriptor.key) {
            log::trace!("Schema store already has {}", descriptor.key);
            return false;
        }
        descriptors.insert(descriptor.key.clone(), descriptor);
        true
    }

    /// Insert many descriptors, returning how many were new
    pub fn extend<I>(&self, descriptors: I) -> usize
    where
        I: IntoIterator<Item = Arc<FieldDescriptor>>,
    {
        descriptors
            .into_iter()
            .filter(|descriptor| self.insert(Arc::clone(descriptor)))
            .count()
    }

    /// Drop every cached view node
    pub fn refresh(&self) {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        log::debug!("Refreshing schema views ({} cached nodes)", views.len());
        views.clear();
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored key in order
    pub fn keys(&self) -> Vec<CategoryKey> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn descriptor(&self, key: &CategoryKey) -> Option<Arc<FieldDescriptor>> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key.without_source())
            .cloned()
    }

    /// View over the whole key space
    pub fn root(self: &Arc<Self>) -> SchemaView {
        self.view(CategoryKey::root())
    }

    /// View rooted at `prefix`
    pub fn view(self: &Arc<Self>, prefix: CategoryKey) -> SchemaView {
        SchemaView {
            store: Arc::clone(self),
            prefix,
        }
    }

    /// Stored keys that `target` is a prefix of (wildcard-aware)
    fn matching(&self, target: &CategoryKey) -> Vec<CategoryKey> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|key| key.starts_with(target))
            .cloned()
            .collect()
    }

    fn node(&self, prefix: &CategoryKey) -> Arc<ViewNode> {
        {
            let views = self.views.read().unwrap_or_else(|e| e.into_inner());
            if let Some(node) = views.get(prefix) {
                return Arc::clone(node);
            }
        }

        let node = Arc::new(self.build_node(prefix));
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(views.entry(prefix.clone()).or_insert(node))
    }

    fn build_node(&self, prefix: &CategoryKey) -> ViewNode {
        let depth = prefix.len();
        // next segment -> suffixes of the keys below it, relative to the child
        let mut shapes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for key in self.matching(prefix) {
            let Some(next) = key.segment(depth) else {
                continue;
            };
            shapes
                .entry(next.to_string())
                .or_default()
                .insert(key.suffix(depth + 1).dotted());
        }

        let mut node = ViewNode::default();
        for segment in shapes.keys() {
            if let Ok(child) = prefix.child(segment) {
                node.children.insert(segment.clone(), child);
            }
        }

        // Two or more siblings sharing one sub-shape get a synthetic wildcard
        // child that browses them together.
        if !node.children.contains_key(WILDCARD) {
            let mut by_shape: HashMap<&BTreeSet<String>, usize> = HashMap::new();
            for shape in shapes.values() {
                *by_shape.entry(shape).or_default() += 1;
            }
            let grouped = by_shape
                .iter()
                .any(|(shape, count)| *count > 1 && shape.iter().any(|s| !s.is_empty()));
            if grouped {
                if let Ok(wildcard) = CategoryKey::parse(WILDCARD) {
                    node.children
                        .insert(WILDCARD.to_string(), prefix.concat(&wildcard));
                }
            }
        }
        node
    }
}

/// Result of a view lookup
#[derive(Debug, Clone)]
pub enum ViewEntry {
    /// The lookup named a leaf
    Descriptor(Arc<FieldDescriptor>),
    /// The lookup named an interior node
    View(SchemaView),
    /// A wildcard lookup matched several branches
    Matches(BTreeMap<CategoryKey, ViewEntry>),
}

impl ViewEntry {
    pub fn descriptor(&self) -> Option<&Arc<FieldDescriptor>> {
        match self {
            ViewEntry::Descriptor(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    pub fn view(&self) -> Option<&SchemaView> {
        match self {
            ViewEntry::View(view) => Some(view),
            _ => None,
        }
    }
}

/// One node of the key hierarchy
#[derive(Clone)]
pub struct SchemaView {
    store: Arc<SchemaStore>,
    prefix: CategoryKey,
}

impl fmt::Debug for SchemaView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaView")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl SchemaView {
    pub fn prefix(&self) -> &CategoryKey {
        &self.prefix
    }

    /// Descriptor stored at exactly this node, if any
    pub fn descriptor(&self) -> Option<Arc<FieldDescriptor>> {
        self.store.descriptor(&self.prefix)
    }

    /// Next-segment children, including a synthetic `*` where siblings share a shape
    pub fn children(&self) -> BTreeMap<String, SchemaView> {
        self.store
            .node(&self.prefix)
            .children
            .iter()
            .map(|(segment, prefix)| (segment.clone(), self.store.view(prefix.clone())))
            .collect()
    }

    /// Segment names of the children
    pub fn child_names(&self) -> Vec<String> {
        self.store.node(&self.prefix).children.keys().cloned().collect()
    }

    /// Every descriptor at or below this node
    pub fn leaves(&self) -> Vec<Arc<FieldDescriptor>> {
        self.store
            .matching(&self.prefix)
            .iter()
            .filter_map(|key| self.store.descriptor(key))
            .collect()
    }

    /// Look up `partial` relative to this node.
    ///
    /// A concrete path names a leaf or a sub-view; a path with wildcards may
    /// match several branches, which are returned together.
    pub fn get(&self, partial: &CategoryKey) -> Result<ViewEntry, SchemaError> {
        let target = self.prefix.concat(partial);
        let depth = target.len();
        let matching = self.store.matching(&target);
        if matching.is_empty() {
            return Err(SchemaError::KeyNotFound(target));
        }

        let mut branches: BTreeMap<CategoryKey, bool> = BTreeMap::new();
        for key in &matching {
            let deeper = key.len() > depth;
            *branches.entry(key.prefix(depth)).or_insert(false) |= deeper;
        }

        let mut entries: BTreeMap<CategoryKey, ViewEntry> = branches
            .into_iter()
            .filter_map(|(branch, deeper)| {
                let entry = if deeper {
                    ViewEntry::View(self.store.view(branch.clone()))
                } else {
                    ViewEntry::Descriptor(self.store.descriptor(&branch)?)
                };
                Some((branch, entry))
            })
            .collect();

        match entries.len() {
            0 => Err(SchemaError::KeyNotFound(target)),
            1 => entries
                .pop_first()
                .map(|(_, entry)| entry)
                .ok_or(SchemaError::KeyNotFound(target)),
            _ => Ok(ViewEntry::Matches(entries)),
        }
    }

    /// Like [`SchemaView::get`], but several matches are an error
    pub fn get_unique(&self, partial: &CategoryKey) -> Result<ViewEntry, SchemaError> {
        match self.get(partial)? {
            ViewEntry::Matches(matches) => Err(SchemaError::AmbiguousKey {
                key: self.prefix.concat(partial),
                matches: matches.into_keys().collect(),
            }),
            entry => Ok(entry),
        }
    }

    /// [`SchemaView::get`] with a dotted path
    pub fn get_str(&self, partial: &str) -> Result<ViewEntry, SchemaError> {
        self.get(&CategoryKey::parse(partial)?)
    }
}
