//! Bi-directional string/id dictionary for categorical metadata
//!
//! Lineages, regions, countries, extra-column names and extra-column values
//! each get their own dense u32 id space. Ids index the precomputed bitmap
//! vectors in the metadata stores, so the dictionary is frozen before any
//! partition is finalized. Lookups of unknown strings return `None`; the
//! query layer folds such misses to the empty filter instead of failing.

use ahash::AHashMap;
use std::io::{BufRead, Write};

use crate::error::{Error, Result};

/// One interned id space: dense names plus the reverse map.
#[derive(Debug, Default, Clone)]
struct IdSpace {
    names: Vec<String>,
    ids: AHashMap<String, u32>,
}

impl IdSpace {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), id);
        id
    }

    fn id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    fn len(&self) -> u32 {
        self.names.len() as u32
    }

    fn from_names(names: Vec<String>) -> Self {
        let ids = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        Self { names, ids }
    }
}

/// The database dictionary: id spaces for every categorical column.
#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    lineages: IdSpace,
    regions: IdSpace,
    countries: IdSpace,
    /// Names of the free-form extra columns, in storage order
    columns: IdSpace,
    /// Shared value space for all extra columns
    values: IdSpace,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a lineage name, returning its id
    pub fn intern_lineage(&mut self, name: &str) -> u32 {
        self.lineages.intern(name)
    }

    /// Intern a region name, returning its id
    pub fn intern_region(&mut self, name: &str) -> u32 {
        self.regions.intern(name)
    }

    /// Intern a country name, returning its id
    pub fn intern_country(&mut self, name: &str) -> u32 {
        self.countries.intern(name)
    }

    /// Register an extra column, returning its index
    pub fn intern_column(&mut self, name: &str) -> u32 {
        self.columns.intern(name)
    }

    /// Intern an extra-column value, returning its id
    pub fn intern_value(&mut self, value: &str) -> u32 {
        self.values.intern(value)
    }

    /// Id of a lineage name, if known
    pub fn lineage_id(&self, name: &str) -> Option<u32> {
        self.lineages.id(name)
    }

    /// Name of a lineage id, if in range
    pub fn lineage_name(&self, id: u32) -> Option<&str> {
        self.lineages.name(id)
    }

    /// Number of known lineages
    pub fn lineage_count(&self) -> u32 {
        self.lineages.len()
    }

    /// Id of a region name, if known
    pub fn region_id(&self, name: &str) -> Option<u32> {
        self.regions.id(name)
    }

    /// Name of a region id, if in range
    pub fn region_name(&self, id: u32) -> Option<&str> {
        self.regions.name(id)
    }

    /// Number of known regions
    pub fn region_count(&self) -> u32 {
        self.regions.len()
    }

    /// Id of a country name, if known
    pub fn country_id(&self, name: &str) -> Option<u32> {
        self.countries.id(name)
    }

    /// Name of a country id, if in range
    pub fn country_name(&self, id: u32) -> Option<&str> {
        self.countries.name(id)
    }

    /// Number of known countries
    pub fn country_count(&self) -> u32 {
        self.countries.len()
    }

    /// Index of an extra column by name
    pub fn column_index(&self, name: &str) -> Option<u32> {
        self.columns.id(name)
    }

    /// Number of extra columns
    pub fn column_count(&self) -> u32 {
        self.columns.len()
    }

    /// Id of an extra-column value, if known
    pub fn value_id(&self, value: &str) -> Option<u32> {
        self.values.id(value)
    }

    /// Write the dictionary as sectioned text (`<section>\t<count>` followed
    /// by one name per line; id equals line order).
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        for (section, space) in self.sections() {
            writeln!(out, "{}\t{}", section, space.len())?;
            for name in &space.names {
                writeln!(out, "{name}")?;
            }
        }
        Ok(())
    }

    /// Read a dictionary saved by [`Dictionary::save`].
    pub fn load<R: BufRead>(input: R) -> Result<Self> {
        let mut lines = input.lines();
        let mut dict = Dictionary::new();
        for section in ["lineages", "regions", "countries", "columns", "values"] {
            let header = lines
                .next()
                .ok_or_else(|| Error::BadDescriptor(format!("dict: missing section {section}")))??;
            let (name, count) = header
                .split_once('\t')
                .ok_or_else(|| Error::BadDescriptor(format!("dict: bad header {header:?}")))?;
            if name != section {
                return Err(Error::BadDescriptor(format!(
                    "dict: expected section {section}, found {name}"
                )));
            }
            let count: usize = count
                .parse()
                .map_err(|_| Error::BadDescriptor(format!("dict: bad count in {header:?}")))?;
            let mut names = Vec::with_capacity(count);
            for _ in 0..count {
                let line = lines.next().ok_or_else(|| {
                    Error::BadDescriptor(format!("dict: truncated section {section}"))
                })??;
                names.push(line);
            }
            let space = IdSpace::from_names(names);
            match section {
                "lineages" => dict.lineages = space,
                "regions" => dict.regions = space,
                "countries" => dict.countries = space,
                "columns" => dict.columns = space,
                _ => dict.values = space,
            }
        }
        Ok(dict)
    }

    fn sections(&self) -> [(&'static str, &IdSpace); 5] {
        [
            ("lineages", &self.lineages),
            ("regions", &self.regions),
            ("countries", &self.countries),
            ("columns", &self.columns),
            ("values", &self.values),
        ]
    }

    /// All lineage names, id order. Used by the sublineage closure.
    pub fn lineage_names(&self) -> &[String] {
        &self.lineages.names
    }
}

/// Resolve a raw lineage name against the alias table.
///
/// The segment before the first `.` is looked up; on a hit it is replaced
/// by its canonical prefix (`BA.5` with `BA -> B.1.1.529` becomes
/// `B.1.1.529.5`). Unknown heads pass through unchanged.
pub fn resolve_alias(aliases: &AHashMap<String, String>, raw: &str) -> String {
    let (head, rest) = match raw.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (raw, None),
    };
    match (aliases.get(head), rest) {
        (Some(canonical), Some(rest)) => format!("{canonical}.{rest}"),
        (Some(canonical), None) => canonical.clone(),
        (None, _) => raw.to_owned(),
    }
}
