// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The state-entry registry: one entry per device serialization descriptor,
//! visited in registration order by the savevm/loadvm state machines.

use std::any::Any;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::stream::StreamReader;
use crate::stream::StreamWriter;
use crate::vmstate::VmStateDescription;

/// Progress report from one `live_iterate` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IterateStatus {
    /// More data remains; call again.
    Again,
    /// This entry has nothing further to send.
    Done,
}

/// Remaining-bytes estimate, split by whether the data can be deferred past
/// the postcopy flip.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingBytes {
    /// Must be transferred before the destination starts running.
    pub precopy_only: u64,
    /// Can be demand-fetched after the flip.
    pub postcopy: u64,
}

impl PendingBytes {
    pub fn total(&self) -> u64 {
        self.precopy_only + self.postcopy
    }
}

/// Session parameters announced to every entry when a save begins.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
pub struct MigrateParams {
    /// Block storage travels with the stream.
    pub blk: bool,
    /// Storage is shared with the destination; send only metadata.
    pub shared: bool,
}

/// Per-device save/load callbacks. Everything defaults to a no-op so simple
/// devices implement only `save`/`load`; iterative producers (RAM) opt in to
/// the live hooks.
pub trait StateOps: Send {
    fn set_params(&mut self, _params: &MigrateParams) {}

    /// Writes the device blob for a SECTION_FULL.
    fn save(&mut self, _w: &mut StreamWriter) -> Result<()> {
        Ok(())
    }

    /// Reads the blob written by `save` (or by `live_*` for PART/END
    /// sections).
    fn load(&mut self, _r: &mut StreamReader, _version_id: u32) -> Result<()> {
        Ok(())
    }

    /// Whether the entry emits a SECTION_FULL at completion.
    fn has_full_state(&self) -> bool {
        true
    }

    /// Whether the entry participates in begin/iterate/complete.
    fn is_iterative(&self) -> bool {
        false
    }

    fn live_setup(&mut self, _w: &mut StreamWriter) -> Result<()> {
        Ok(())
    }

    fn live_iterate(&mut self, _w: &mut StreamWriter) -> Result<IterateStatus> {
        Ok(IterateStatus::Done)
    }

    fn live_complete(&mut self, _w: &mut StreamWriter) -> Result<()> {
        Ok(())
    }

    fn pending(&self, _max_size: u64) -> PendingBytes {
        PendingBytes::default()
    }

    fn cancel(&mut self) {}

    /// Whether the remaining data may be deferred past the postcopy flip.
    fn postcopiable(&self) -> bool {
        false
    }

    /// A non-migratable device reports why, which blocks the whole session.
    fn blocked_reason(&self) -> Option<String> {
        None
    }
}

/// What an entry registered: either an opaque callback pair or a structured
/// schema walked by the engine.
#[derive(Clone)]
pub enum StateHandler {
    Ops(Arc<Mutex<dyn StateOps>>),
    Schema {
        desc: Arc<VmStateDescription>,
        state: Arc<Mutex<dyn Any + Send>>,
    },
}

impl StateHandler {
    /// Identity of the registered state object. `unregister` matches on it,
    /// never on its contents.
    pub fn opaque_ptr(&self) -> usize {
        match self {
            StateHandler::Ops(ops) => Arc::as_ptr(ops) as *const () as usize,
            StateHandler::Schema { state, .. } => Arc::as_ptr(state) as *const () as usize,
        }
    }
}

/// Identifier an older stream may still use for this entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompatInfo {
    pub idstr: String,
    pub instance_id: u32,
}

pub struct StateEntry {
    idstr: String,
    compat: Option<CompatInfo>,
    instance_id: u32,
    alias_id: Option<u32>,
    version_id: u32,
    section_id: u32,
    is_ram: bool,
    handler: StateHandler,
}

impl StateEntry {
    pub fn idstr(&self) -> &str {
        &self.idstr
    }

    pub fn compat(&self) -> Option<&CompatInfo> {
        self.compat.as_ref()
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn alias_id(&self) -> Option<u32> {
        self.alias_id
    }

    pub fn version_id(&self) -> u32 {
        self.version_id
    }

    pub fn section_id(&self) -> u32 {
        self.section_id
    }

    pub fn is_ram(&self) -> bool {
        self.is_ram
    }

    pub fn handler(&self) -> &StateHandler {
        &self.handler
    }
}

pub struct RegisterRequest<'a> {
    /// Path of the owning device; prefixed onto `idstr` and recorded as the
    /// legacy identifier.
    pub device_path: Option<&'a str>,
    pub idstr: &'a str,
    /// `None` auto-assigns the next free instance for this identifier.
    pub instance_id: Option<u32>,
    pub alias_id: Option<u32>,
    pub version_id: u32,
    pub is_ram: bool,
    pub handler: StateHandler,
}

impl<'a> RegisterRequest<'a> {
    pub fn new(idstr: &'a str, instance_id: Option<u32>, version_id: u32, handler: StateHandler) -> Self {
        RegisterRequest {
            device_path: None,
            idstr,
            instance_id,
            alias_id: None,
            version_id,
            is_ram: false,
            handler,
        }
    }
}

/// Ordered set of state entries. Registration order defines transmit order;
/// section identifiers are unique and monotonic for the life of the registry,
/// surviving unregistration.
#[derive(Default)]
pub struct StateRegistry {
    entries: Vec<StateEntry>,
    next_section_id: u32,
}

impl StateRegistry {
    pub fn new() -> StateRegistry {
        StateRegistry::default()
    }

    /// Appends a new entry and returns its section identifier.
    pub fn register(&mut self, req: RegisterRequest) -> Result<u32> {
        let (idstr, compat, instance_id) = match req.device_path {
            Some(path) => {
                let prefixed = format!("{}/{}", path, req.idstr);
                let compat = CompatInfo {
                    idstr: req.idstr.to_owned(),
                    instance_id: req.instance_id.unwrap_or(0),
                };
                // A device-owned entry is always auto-assigned under its
                // prefixed identifier.
                (prefixed, Some(compat), None)
            }
            None => (req.idstr.to_owned(), None, req.instance_id),
        };
        if idstr.len() > u8::MAX as usize {
            return Err(Error::Format(format!("identifier too long: {}", idstr)));
        }

        let instance_id = match instance_id {
            Some(id) => {
                if self.find(&idstr, id).is_some() {
                    return Err(Error::Protocol(format!(
                        "state entry {} instance {} already registered",
                        idstr, id
                    )));
                }
                id
            }
            None => self.next_instance(&idstr),
        };

        let section_id = self.next_section_id;
        self.next_section_id += 1;

        self.entries.push(StateEntry {
            idstr,
            compat,
            instance_id,
            alias_id: req.alias_id,
            version_id: req.version_id,
            section_id,
            is_ram: req.is_ram,
            handler: req.handler,
        });
        Ok(section_id)
    }

    fn next_instance(&self, idstr: &str) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.idstr == idstr)
            .map(|e| e.instance_id + 1)
            .max()
            .unwrap_or(0)
    }

    /// Removes every entry whose effective identifier and opaque handle both
    /// match.
    pub fn unregister(&mut self, device_path: Option<&str>, idstr: &str, opaque: usize) {
        let effective = match device_path {
            Some(path) => format!("{}/{}", path, idstr),
            None => idstr.to_owned(),
        };
        self.entries
            .retain(|e| e.idstr != effective || e.handler.opaque_ptr() != opaque);
    }

    pub fn find_index(&self, idstr: &str, instance_id: u32) -> Option<usize> {
        self.entries.iter().position(|e| {
            let alias_hit = e.alias_id == Some(instance_id);
            if e.idstr == idstr && (e.instance_id == instance_id || alias_hit) {
                return true;
            }
            // Older streams carry the un-prefixed name of a device-owned
            // entry.
            match &e.compat {
                Some(c) => c.idstr == idstr && (c.instance_id == instance_id || alias_hit),
                None => false,
            }
        })
    }

    pub fn find(&self, idstr: &str, instance_id: u32) -> Option<&StateEntry> {
        self.find_index(idstr, instance_id).map(|i| &self.entries[i])
    }

    /// Returns the identifier of the first entry refusing migration, if any.
    pub fn any_blocked(&self) -> Option<(String, String)> {
        self.entries.iter().find_map(|e| match &e.handler {
            StateHandler::Ops(ops) => ops
                .lock()
                .blocked_reason()
                .map(|reason| (e.idstr.clone(), reason)),
            StateHandler::Schema { .. } => None,
        })
    }

    pub fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl StateOps for Nop {}

    fn ops_handler() -> StateHandler {
        StateHandler::Ops(Arc::new(Mutex::new(Nop)))
    }

    fn register_simple(reg: &mut StateRegistry, idstr: &str, instance: Option<u32>) -> u32 {
        reg.register(RegisterRequest::new(idstr, instance, 1, ops_handler()))
            .unwrap()
    }

    #[test]
    fn section_ids_strictly_increase() {
        let mut reg = StateRegistry::new();
        let a = register_simple(&mut reg, "a", Some(0));
        let b = register_simple(&mut reg, "b", Some(0));
        assert!(b > a);

        // Unregistering must not allow id reuse.
        let opaque = reg.entries()[0].handler().opaque_ptr();
        reg.unregister(None, "a", opaque);
        let c = register_simple(&mut reg, "c", Some(0));
        assert!(c > b);
    }

    #[test]
    fn auto_instance_assignment() {
        let mut reg = StateRegistry::new();
        register_simple(&mut reg, "serial", None);
        register_simple(&mut reg, "serial", None);
        register_simple(&mut reg, "other", None);
        assert_eq!(reg.find("serial", 0).unwrap().instance_id(), 0);
        assert_eq!(reg.find("serial", 1).unwrap().instance_id(), 1);
        assert_eq!(reg.find("other", 0).unwrap().instance_id(), 0);
    }

    #[test]
    fn duplicate_explicit_instance_rejected() {
        let mut reg = StateRegistry::new();
        register_simple(&mut reg, "serial", Some(3));
        let err = reg
            .register(RegisterRequest::new("serial", Some(3), 1, ops_handler()))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn device_path_prefix_and_compat_find() {
        let mut reg = StateRegistry::new();
        let req = RegisterRequest {
            device_path: Some("pci/00:01.0"),
            instance_id: Some(2),
            ..RegisterRequest::new("e1000", None, 1, ops_handler())
        };
        reg.register(req).unwrap();

        let e = reg.find("pci/00:01.0/e1000", 0).unwrap();
        assert_eq!(e.idstr(), "pci/00:01.0/e1000");
        // Device-owned entries are auto-assigned under the prefixed name.
        assert_eq!(e.instance_id(), 0);
        // The original identifier and instance still resolve for old streams.
        assert_eq!(
            e.compat(),
            Some(&CompatInfo {
                idstr: "e1000".to_owned(),
                instance_id: 2,
            })
        );
        assert!(reg.find("e1000", 2).is_some());
        assert!(reg.find("e1000", 7).is_none());
    }

    #[test]
    fn alias_instance_matches() {
        let mut reg = StateRegistry::new();
        let req = RegisterRequest {
            alias_id: Some(9),
            ..RegisterRequest::new("timer", Some(0), 1, ops_handler())
        };
        reg.register(req).unwrap();
        assert!(reg.find("timer", 9).is_some());
    }

    #[test]
    fn unregister_matches_opaque() {
        let mut reg = StateRegistry::new();
        let keep = Arc::new(Mutex::new(Nop));
        let drop_me = Arc::new(Mutex::new(Nop));
        reg.register(RegisterRequest::new(
            "dev",
            Some(0),
            1,
            StateHandler::Ops(keep.clone()),
        ))
        .unwrap();
        reg.register(RegisterRequest::new(
            "dev",
            Some(1),
            1,
            StateHandler::Ops(drop_me.clone()),
        ))
        .unwrap();

        let opaque = Arc::as_ptr(&drop_me) as *const () as usize;
        reg.unregister(None, "dev", opaque);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.entries()[0].instance_id(), 0);
    }

    struct Stuck;
    impl StateOps for Stuck {
        fn blocked_reason(&self) -> Option<String> {
            Some("device holds a host resource".to_owned())
        }
    }

    #[test]
    fn blocked_entry_reported() {
        let mut reg = StateRegistry::new();
        register_simple(&mut reg, "ok", Some(0));
        assert!(reg.any_blocked().is_none());
        reg.register(RegisterRequest::new(
            "stuck",
            Some(0),
            1,
            StateHandler::Ops(Arc::new(Mutex::new(Stuck))),
        ))
        .unwrap();
        let (idstr, _reason) = reg.any_blocked().unwrap();
        assert_eq!(idstr, "stuck");
    }
}
