use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe)
}

/// One engine per tenant, where a tenant is the database name of the
/// connection. Each engine owns `<data_dir>/<tenant>.wal` and a compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create (replaying its WAL) the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; only one engine
        // may own the WAL file.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));

        info!("opened tenant {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}
