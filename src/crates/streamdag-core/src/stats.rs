//! Thread-safe engine introspection snapshots.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Per-function snapshot values.
#[derive(Debug, Clone, Serialize)]
pub struct FuncStats {
    pub running: bool,
    pub loaded: bool,
    pub closed: bool,
    pub is_leaf: bool,
    pub input_count: u64,
}

/// A disconnected snapshot of engine state, taken under the graph mutex.
///
/// Keys are function names; a same-named sibling gets its handle address
/// appended so no entry is lost. `Display` renders a plain-text report;
/// `Serialize` is available for drivers that export metrics as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub name: String,
    pub loaded: bool,
    pub num_vertices: usize,
    pub num_edges: usize,
    pub funcs: BTreeMap<String, FuncStats>,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "engine: {} loaded={} vertices={} edges={}",
            self.name, self.loaded, self.num_vertices, self.num_edges
        )?;
        for (name, fs) in &self.funcs {
            writeln!(
                f,
                "  {}: running={} loaded={} closed={} leaf={} inputs={}",
                name, fs.running, fs.loaded, fs.closed, fs.is_leaf, fs.input_count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_renders_every_func() {
        let mut funcs = BTreeMap::new();
        funcs.insert(
            "f1".to_string(),
            FuncStats {
                running: true,
                loaded: true,
                closed: false,
                is_leaf: true,
                input_count: 3,
            },
        );
        let stats = Stats {
            name: "test".to_string(),
            loaded: true,
            num_vertices: 1,
            num_edges: 0,
            funcs,
        };

        let text = stats.to_string();
        assert!(text.contains("engine: test loaded=true vertices=1 edges=0"));
        assert!(text.contains("f1: running=true loaded=true closed=false leaf=true inputs=3"));
    }

    #[test]
    fn test_serializes_to_json() {
        let stats = Stats {
            name: "test".to_string(),
            loaded: false,
            num_vertices: 0,
            num_edges: 0,
            funcs: BTreeMap::new(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["name"], "test");
        assert_eq!(json["loaded"], false);
    }
}
