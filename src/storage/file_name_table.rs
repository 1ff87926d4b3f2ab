//! Path interner.
//!
//! Paths are split on `/` and each component is stored once in an inner
//! string table. A full path is a chain of `(component, parent)` links, so
//! `/usr/include/a.h` and `/usr/include/b.h` share their directory prefix.
//! Only paths that were explicitly added resolve; a prefix that merely
//! exists as a chain of intermediate nodes is not a match.

use super::serialization::{Extractor, Insertor, ObjectHeader, OBJECT_HEADER_SIZE};
use super::string_table::{StringKey, StringTable, INVALID_KEY};
use super::{KeyMap, StoreError, StoreResult};

use std::collections::HashMap;

pub type PathKey = u32;

pub const INVALID_PATH_KEY: PathKey = 0;

const SERIAL_TAG: &str = "ftags::Paths";

/// Splits on `/`, collapsing runs of separators. A leading `/` yields an
/// empty first element so absolute paths keep their root.
pub fn split_path(path: &str) -> Vec<&str> {
    let mut elements = Vec::new();
    let mut rest = path;
    if let Some(stripped) = path.strip_prefix('/') {
        elements.push(&path[..0]);
        rest = stripped;
    }
    elements.extend(rest.split('/').filter(|element| !element.is_empty()));
    elements
}

#[derive(Clone, Copy)]
struct PathNode {
    element_key: StringKey,
    parent_key: PathKey,
    reference_count: u32,
    is_terminal: bool,
}

pub struct FileNameTable {
    path_elements: StringTable,

    /// All nodes, indexed by `PathKey`; slot 0 is the invalid sentinel.
    nodes: Vec<PathNode>,

    /// (element, parent) -> child node; transient, rebuilt on load
    child_index: HashMap<(StringKey, PathKey), PathKey>,
}

impl Default for FileNameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileNameTable {
    pub fn new() -> Self {
        Self {
            path_elements: StringTable::new(),
            nodes: vec![PathNode {
                element_key: INVALID_KEY,
                parent_key: INVALID_PATH_KEY,
                reference_count: 0,
                is_terminal: false,
            }],
            child_index: HashMap::new(),
        }
    }

    /// Interns `path`, creating the missing chain nodes and bumping the
    /// reference count of the shared ones. The final node is marked
    /// terminal so lookups only match complete paths.
    pub fn add_key(&mut self, path: &str) -> StoreResult<PathKey> {
        let elements = split_path(path);
        if elements.is_empty() {
            return Ok(INVALID_PATH_KEY);
        }

        let mut current = INVALID_PATH_KEY;
        for element in elements {
            let element_key = self.path_elements.add_key(element)?;
            match self.child_index.get(&(element_key, current)) {
                Some(&existing) => {
                    self.nodes[existing as usize].reference_count += 1;
                    current = existing;
                }
                None => {
                    let created = self.nodes.len() as PathKey;
                    self.nodes.push(PathNode {
                        element_key,
                        parent_key: current,
                        reference_count: 1,
                        is_terminal: false,
                    });
                    self.child_index.insert((element_key, current), created);
                    current = created;
                }
            }
        }

        self.nodes[current as usize].is_terminal = true;
        Ok(current)
    }

    /// Key of `path` if it was added as a complete path; intermediate
    /// directory nodes do not match.
    pub fn get_key(&self, path: &str) -> PathKey {
        let elements = split_path(path);
        if elements.is_empty() {
            return INVALID_PATH_KEY;
        }

        let mut current = INVALID_PATH_KEY;
        for element in elements {
            let element_key = self.path_elements.get_key(element);
            if element_key == INVALID_KEY {
                return INVALID_PATH_KEY;
            }
            match self.child_index.get(&(element_key, current)) {
                Some(&child) => current = child,
                None => return INVALID_PATH_KEY,
            }
        }

        if self.nodes[current as usize].is_terminal {
            current
        } else {
            INVALID_PATH_KEY
        }
    }

    /// Walks the chain decrementing reference counts and clears the
    /// terminal flag on the last node. Unreferenced non-terminal nodes are
    /// left in place; reaping them is an optimization, not a requirement.
    pub fn remove_key(&mut self, path: &str) {
        let elements = split_path(path);
        if elements.is_empty() {
            return;
        }

        let mut current = INVALID_PATH_KEY;
        for element in elements {
            let element_key = self.path_elements.get_key(element);
            if element_key == INVALID_KEY {
                return;
            }
            match self.child_index.get(&(element_key, current)) {
                Some(&child) => {
                    current = child;
                    let node = &mut self.nodes[current as usize];
                    node.reference_count = node.reference_count.saturating_sub(1);
                }
                None => return,
            }
        }

        self.nodes[current as usize].is_terminal = false;
    }

    /// Reassembles the path for `key` by walking the parent links.
    pub fn get_path(&self, key: PathKey) -> Option<String> {
        if key == INVALID_PATH_KEY || key as usize >= self.nodes.len() {
            return None;
        }

        let mut elements = Vec::new();
        let mut current = key;
        while current != INVALID_PATH_KEY {
            let node = &self.nodes[current as usize];
            elements.push(self.path_elements.get_string(node.element_key)?);
            current = node.parent_key;
        }

        elements.reverse();
        Some(elements.join("/"))
    }

    pub fn terminal_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_terminal).count()
    }

    /// Imports every node of `other`, returning a mapping from `other`'s
    /// path keys to the corresponding keys here. Nodes arrive parent-first
    /// because keys are only ever appended.
    pub fn merge_from(&mut self, other: &FileNameTable) -> StoreResult<KeyMap> {
        let mut mapping = KeyMap::with_capacity(other.nodes.len());
        mapping.insert(INVALID_PATH_KEY, INVALID_PATH_KEY);

        for (index, node) in other.nodes.iter().enumerate().skip(1) {
            let parent = mapping[&node.parent_key];
            let element = other
                .path_elements
                .get_string(node.element_key)
                .ok_or(StoreError::InvalidKey(node.element_key))?;
            let element_key = self.path_elements.add_key(element)?;

            let own = match self.child_index.get(&(element_key, parent)) {
                Some(&existing) => {
                    let target = &mut self.nodes[existing as usize];
                    target.reference_count += node.reference_count;
                    target.is_terminal |= node.is_terminal;
                    existing
                }
                None => {
                    let created = self.nodes.len() as PathKey;
                    self.nodes.push(PathNode {
                        element_key,
                        parent_key: parent,
                        reference_count: node.reference_count,
                        is_terminal: node.is_terminal,
                    });
                    self.child_index.insert((element_key, parent), created);
                    created
                }
            };
            mapping.insert(index as PathKey, own);
        }

        Ok(mapping)
    }

    pub fn serialized_size(&self) -> u64 {
        OBJECT_HEADER_SIZE
            + self.path_elements.serialized_size()
            + 8
            + (self.nodes.len() as u64 - 1) * 12
    }

    pub fn serialize(&self, insertor: &mut Insertor) -> StoreResult<()> {
        let header = ObjectHeader::new(SERIAL_TAG, self.serialized_size() - OBJECT_HEADER_SIZE);
        insertor.put_header(&header)?;

        self.path_elements.serialize(insertor)?;

        insertor.put_u64(self.nodes.len() as u64 - 1)?;
        for node in &self.nodes[1..] {
            insertor.put_u32(node.element_key)?;
            insertor.put_u32(node.parent_key)?;
            let packed = (node.reference_count << 1) | u32::from(node.is_terminal);
            insertor.put_u32(packed)?;
        }
        Ok(())
    }

    pub fn deserialize(extractor: &mut Extractor) -> StoreResult<Self> {
        extractor.expect_header(SERIAL_TAG)?;

        let path_elements = StringTable::deserialize(extractor)?;
        let node_count = extractor.get_u64()?;

        let mut table = Self {
            path_elements,
            ..Self::new()
        };

        for index in 0..node_count {
            let element_key = extractor.get_u32()?;
            let parent_key = extractor.get_u32()?;
            let packed = extractor.get_u32()?;

            // parents always precede their children
            if parent_key > index as PathKey {
                return Err(StoreError::DeserializationMismatch(format!(
                    "path node {} references a later parent {}",
                    index + 1,
                    parent_key
                )));
            }

            let node = PathNode {
                element_key,
                parent_key,
                reference_count: packed >> 1,
                is_terminal: packed & 1 == 1,
            };
            let key = table.nodes.len() as PathKey;
            table.nodes.push(node);
            table.child_index.insert((element_key, parent_key), key);
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::serialization::{BufferSink, BufferSource};
    use test_case::test_case;

    #[test_case("/home/test/foo", &["", "home", "test", "foo"]; "absolute path keeps the root")]
    #[test_case("a///b", &["a", "b"]; "separator runs collapse")]
    #[test_case("relative/path", &["relative", "path"]; "relative path")]
    #[test_case("/", &[""]; "bare root")]
    #[test_case("", &[]; "empty input")]
    fn split_path_cases(input: &str, expected: &[&str]) {
        assert_eq!(split_path(input), expected);
    }

    #[test]
    fn added_path_round_trips() {
        let mut table = FileNameTable::new();
        let key = table.add_key("/home/test/foo").unwrap();
        assert_ne!(key, INVALID_PATH_KEY);
        assert_eq!(table.get_key("/home/test/foo"), key);
        assert_eq!(table.get_path(key).as_deref(), Some("/home/test/foo"));
    }

    #[test]
    fn relative_path_round_trips() {
        let mut table = FileNameTable::new();
        let key = table.add_key("src/db/project.cc").unwrap();
        assert_eq!(table.get_path(key).as_deref(), Some("src/db/project.cc"));
    }

    #[test]
    fn prefix_is_not_a_path_until_added() {
        let mut table = FileNameTable::new();
        table.add_key("/home/test/foo").unwrap();
        table.add_key("/home/test/bar").unwrap();

        assert_eq!(table.get_key("/home/test"), INVALID_PATH_KEY);

        let key = table.add_key("/home/test").unwrap();
        assert_ne!(key, INVALID_PATH_KEY);
        assert_eq!(table.get_key("/home/test"), key);
    }

    #[test]
    fn siblings_share_their_prefix_nodes() {
        let mut table = FileNameTable::new();
        let foo = table.add_key("/usr/include/foo.h").unwrap();
        let bar = table.add_key("/usr/include/bar.h").unwrap();
        assert_ne!(foo, bar);

        // "", "usr", "include" are shared; only the leaves differ
        assert_eq!(table.nodes.len() - 1, 5);
    }

    #[test]
    fn remove_clears_the_terminal_flag() {
        let mut table = FileNameTable::new();
        let key = table.add_key("/home/test/foo").unwrap();
        table.remove_key("/home/test/foo");

        assert_eq!(table.get_key("/home/test/foo"), INVALID_PATH_KEY);
        // the chain is still walkable for other references
        assert_eq!(table.get_path(key).as_deref(), Some("/home/test/foo"));
    }

    #[test]
    fn merge_translates_foreign_keys() {
        let mut left = FileNameTable::new();
        let mut right = FileNameTable::new();

        left.add_key("/home/test/foo").unwrap();
        let right_bar = right.add_key("/home/test/bar").unwrap();

        let mapping = left.merge_from(&right).unwrap();
        let mapped = mapping[&right_bar];

        assert_eq!(left.get_key("/home/test/bar"), mapped);
        assert_eq!(left.get_path(mapped).as_deref(), Some("/home/test/bar"));
    }

    #[test]
    fn serialization_round_trips_nodes_and_flags() {
        let mut table = FileNameTable::new();
        let foo = table.add_key("/home/test/foo").unwrap();
        let bar = table.add_key("/home/test/bar").unwrap();
        table.add_key("/var/log").unwrap();
        table.remove_key("/var/log");

        let mut sink = BufferSink::with_expected_size(table.serialized_size());
        table.serialize(&mut Insertor::new(&mut sink)).unwrap();
        let bytes = sink.into_bytes();

        let mut source = BufferSource::new(&bytes);
        let restored = FileNameTable::deserialize(&mut Extractor::new(&mut source)).unwrap();
        source.assert_drained();

        assert_eq!(restored.get_key("/home/test/foo"), foo);
        assert_eq!(restored.get_key("/home/test/bar"), bar);
        assert_eq!(restored.get_key("/var/log"), INVALID_PATH_KEY);
        assert_eq!(restored.get_path(foo).as_deref(), Some("/home/test/foo"));
        assert_eq!(restored.terminal_count(), 2);
    }
}
