use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::ResultStore;

/// Running sum and count of one KPI
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KpiStats {
    pub sum: f64,
    pub count: usize,
}

impl KpiStats {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }
}

/// Aggregate every numeric top-level result field across stored records.
///
/// KPIs are keyed `<stage>.<field>`; records whose files are gone are skipped.
pub fn summarize(store: &ResultStore, experiment: Option<&str>) -> Result<BTreeMap<String, KpiStats>> {
    let mut kpis: BTreeMap<String, KpiStats> = BTreeMap::new();

    for entry in store.entries()? {
        if experiment.is_some_and(|name| name != entry.experiment) {
            continue;
        }

        let record = match store.read(&entry.file) {
            Ok(record) => record,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %entry.file, "Result file missing, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };

        for (field, value) in &record.results {
            if let Some(value) = value.as_f64() {
                kpis.entry(format!("{}.{}", entry.stage, field))
                    .or_default()
                    .push(value);
            }
        }
    }

    Ok(kpis)
}
