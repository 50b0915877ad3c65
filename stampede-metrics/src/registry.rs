use dashmap::DashMap;
use parking_lot::RwLock;

use crate::key::{Interner, KeyId};
use crate::metrics::{MetricKind, MetricSeriesSummary, MetricStorage};
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(u32);

#[derive(Debug)]
struct MetricDef {
    name: KeyId,
    kind: MetricKind,
}

/// One metric's storage: the untagged base series plus any submetric series
/// declared by thresholds. A sample always lands in the base series and in
/// every submetric whose selector is a subset of the sample's tags.
#[derive(Debug)]
struct MetricSeries {
    base: MetricStorage,
    subs: RwLock<Vec<(TagSet, MetricStorage)>>,
}

#[derive(Debug, Default)]
pub struct Registry {
    interner: Interner,
    defs: RwLock<Vec<MetricDef>>,
    series: DashMap<MetricId, MetricSeries>,
}

impl Registry {
    pub fn register(&self, name: &str, kind: MetricKind) -> MetricId {
        let name_id = self.interner.get_or_intern(name);

        let mut defs = self.defs.write();
        if let Some((idx, _)) = defs.iter().enumerate().find(|(_, d)| d.name == name_id) {
            return MetricId(idx as u32);
        }

        let id = MetricId(defs.len() as u32);
        defs.push(MetricDef {
            name: name_id,
            kind,
        });
        self.series.insert(
            id,
            MetricSeries {
                base: MetricStorage::new(kind),
                subs: RwLock::new(Vec::new()),
            },
        );
        id
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        let name_id = self.interner.lookup(name)?;
        let defs = self.defs.read();
        defs.iter().find(|d| d.name == name_id).map(|d| d.kind)
    }

    pub fn resolve_tags(&self, tags: &[(String, String)]) -> TagSet {
        TagSet::new(tags.iter().map(|(k, v)| {
            (
                self.interner.get_or_intern(k),
                self.interner.get_or_intern(v),
            )
        }))
    }

    /// Declares a tagged submetric (`name{key:value}`), creating its series.
    /// Thresholds call this during setup so the matching samples get their
    /// own sink.
    pub fn add_submetric(&self, name: &str, kind: MetricKind, selector: &[(String, String)]) {
        let id = self.register(name, kind);
        let selector = self.resolve_tags(selector);
        if selector.is_empty() {
            return;
        }

        if let Some(series) = self.series.get(&id) {
            let mut subs = series.subs.write();
            if !subs.iter().any(|(s, _)| *s == selector) {
                subs.push((selector, MetricStorage::new(kind)));
            }
        }
    }

    /// Folds a sample into the metric's base series and every submetric whose
    /// selector matches the sample's tags.
    pub fn apply(&self, name: &str, kind: MetricKind, value: f64, tags: &[(String, String)]) {
        let id = self.register(name, kind);
        let series = match self.series.get(&id) {
            Some(s) => s,
            None => return,
        };

        series.base.handle().record(value);

        let subs = series.subs.read();
        if subs.is_empty() {
            return;
        }
        let tags = self.resolve_tags(tags);
        for (selector, storage) in subs.iter() {
            if selector.subset_of(&tags) {
                storage.handle().record(value);
            }
        }
    }

    /// Snapshot of every series (base first, then submetrics), sorted by
    /// metric name. Reads take the same locks as writes so each series value
    /// is internally consistent.
    pub fn summarize(&self) -> Vec<MetricSeriesSummary> {
        let defs = self.defs.read();
        let mut out = Vec::new();

        for entry in self.series.iter() {
            let id = *entry.key();
            let series = entry.value();

            let def = match defs.get(id.0 as usize) {
                Some(d) => d,
                None => continue,
            };
            let name = self
                .interner
                .resolve(def.name)
                .map(|s| s.to_string())
                .unwrap_or_default();

            out.push(MetricSeriesSummary {
                name: name.clone(),
                kind: def.kind,
                tags: Vec::new(),
                values: series.base.value(),
            });

            for (selector, storage) in series.subs.read().iter() {
                out.push(MetricSeriesSummary {
                    name: name.clone(),
                    kind: def.kind,
                    tags: self.tag_strings(selector),
                    values: storage.value(),
                });
            }
        }

        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.tags.len().cmp(&b.tags.len())));
        out
    }

    /// All series for a single metric, or an empty vec if it was never
    /// registered.
    pub fn snapshot(&self, name: &str) -> Vec<MetricSeriesSummary> {
        self.summarize()
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }

    fn tag_strings(&self, tags: &TagSet) -> Vec<(String, String)> {
        tags.iter()
            .map(|(k, v)| {
                (
                    self.interner
                        .resolve(k)
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    self.interner
                        .resolve(v)
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                )
            })
            .collect()
    }
}
