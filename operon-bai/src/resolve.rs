use fxhash::FxHashMap;

use operon_bam::References;

/// Maps user-facing reference names to ids for queries.
///
/// Exact match wins; otherwise a permissive pass compares names with
/// any `chr` prefix stripped, case-insensitively.
#[derive(Debug, Default)]
pub struct RefResolver {
    exact: FxHashMap<String, usize>,
    permissive: FxHashMap<String, usize>,
}

fn canonical(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    match upper.strip_prefix("CHR") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => upper,
    }
}

impl RefResolver {
    pub fn new<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut resolver = RefResolver::default();
        for (id, name) in names.into_iter().enumerate() {
            resolver.exact.entry(name.to_string()).or_insert(id);
            resolver.permissive.entry(canonical(name)).or_insert(id);
        }
        resolver
    }

    pub fn from_references(references: &References) -> Self {
        RefResolver::new(references.iter().map(|r| r.name()))
    }

    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.exact
            .get(name)
            .or_else(|| self.permissive.get(&canonical(name)))
            .copied()
    }
}

// --- BEGIN TESTS --- //


// --- END TESTS --- //
