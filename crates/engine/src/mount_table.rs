use anyhow::{anyhow, Result};
use mountwright_core::{DiskHost, MountTable, PersistentMountRecord};
use std::sync::{Arc, Mutex, PoisonError};

/// Single access point for persistent mount table edits.
///
/// Every read-modify-write cycle runs under one mutex, so concurrent device
/// lifecycles never interleave their edits. The guard is dropped on every
/// exit path, including errors returned by the host.
pub struct MountTableEditor {
    host: Arc<dyn DiskHost>,
    lock: Mutex<()>,
}

impl MountTableEditor {
    pub fn new(host: Arc<dyn DiskHost>) -> Self {
        Self {
            host,
            lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Result<MountTable> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = self.host.read_mount_table()?;
        Ok(MountTable::parse(&contents))
    }

    pub fn remove_matching(
        &self,
        predicate: impl Fn(&PersistentMountRecord) -> bool,
    ) -> Result<Vec<PersistentMountRecord>> {
        self.edit(|table| table.remove_matching(&predicate))
    }

    pub fn append(&self, record: PersistentMountRecord) -> Result<()> {
        self.edit(|table| table.append(record))
    }

    fn edit<R>(&self, apply: impl FnOnce(&mut MountTable) -> R) -> Result<R> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut apply = Some(apply);
        let mut outcome = None;
        self.host.update_mount_table(&mut |contents| {
            let apply = apply
                .take()
                .ok_or_else(|| anyhow!("mount table edit applied twice"))?;
            let mut table = MountTable::parse(&contents);
            outcome = Some(apply(&mut table));
            Ok(table.render())
        })?;
        outcome.ok_or_else(|| anyhow!("mount table edit was never applied"))
    }
}
