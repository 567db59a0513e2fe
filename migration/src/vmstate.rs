// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Structured schema descriptors: instead of opaque callbacks, an entry may
//! describe its state as a versioned field list the engine walks itself.

use std::any::Any;

use crate::error::Error;
use crate::error::Result;
use crate::stream::StreamReader;
use crate::stream::StreamWriter;

type Getter<V> = Box<dyn Fn(&dyn Any) -> V + Send + Sync>;
type Setter<V> = Box<dyn Fn(&mut dyn Any, V) + Send + Sync>;

pub enum FieldAccess {
    U8(Getter<u8>, Setter<u8>),
    U16(Getter<u16>, Setter<u16>),
    U32(Getter<u32>, Setter<u32>),
    U64(Getter<u64>, Setter<u64>),
    /// Variable-length bytes, 4-byte length prefix on the wire.
    Buffer(Getter<Vec<u8>>, Setter<Vec<u8>>),
}

pub struct VmStateField {
    pub name: &'static str,
    /// Schema version that introduced the field; skipped when loading older
    /// streams.
    pub since_version: u32,
    access: FieldAccess,
}

// The registrant binds typed accessors to its concrete state type; binding a
// field to the wrong type is a registration bug, caught on first walk.
fn state_ref<'a, S: Any>(state: &'a dyn Any, field: &'static str) -> &'a S {
    state
        .downcast_ref()
        .unwrap_or_else(|| panic!("vmstate field {} bound to wrong state type", field))
}

fn state_mut<'a, S: Any>(state: &'a mut dyn Any, field: &'static str) -> &'a mut S {
    state
        .downcast_mut()
        .unwrap_or_else(|| panic!("vmstate field {} bound to wrong state type", field))
}

impl VmStateField {
    pub fn u8<S: Any>(name: &'static str, since: u32, get: fn(&S) -> u8, set: fn(&mut S, u8)) -> VmStateField {
        VmStateField {
            name,
            since_version: since,
            access: FieldAccess::U8(
                Box::new(move |s| get(state_ref(s, name))),
                Box::new(move |s, v| set(state_mut(s, name), v)),
            ),
        }
    }

    pub fn u16<S: Any>(name: &'static str, since: u32, get: fn(&S) -> u16, set: fn(&mut S, u16)) -> VmStateField {
        VmStateField {
            name,
            since_version: since,
            access: FieldAccess::U16(
                Box::new(move |s| get(state_ref(s, name))),
                Box::new(move |s, v| set(state_mut(s, name), v)),
            ),
        }
    }

    pub fn u32<S: Any>(name: &'static str, since: u32, get: fn(&S) -> u32, set: fn(&mut S, u32)) -> VmStateField {
        VmStateField {
            name,
            since_version: since,
            access: FieldAccess::U32(
                Box::new(move |s| get(state_ref(s, name))),
                Box::new(move |s, v| set(state_mut(s, name), v)),
            ),
        }
    }

    pub fn u64<S: Any>(name: &'static str, since: u32, get: fn(&S) -> u64, set: fn(&mut S, u64)) -> VmStateField {
        VmStateField {
            name,
            since_version: since,
            access: FieldAccess::U64(
                Box::new(move |s| get(state_ref(s, name))),
                Box::new(move |s, v| set(state_mut(s, name), v)),
            ),
        }
    }

    pub fn buffer<S: Any>(
        name: &'static str,
        since: u32,
        get: fn(&S) -> Vec<u8>,
        set: fn(&mut S, Vec<u8>),
    ) -> VmStateField {
        VmStateField {
            name,
            since_version: since,
            access: FieldAccess::Buffer(
                Box::new(move |s| get(state_ref(s, name))),
                Box::new(move |s, v| set(state_mut(s, name), v)),
            ),
        }
    }
}

pub struct VmStateDescription {
    pub name: &'static str,
    pub version_id: u32,
    pub minimum_version_id: u32,
    pub fields: Vec<VmStateField>,
}

impl VmStateDescription {
    /// Writes every field in declaration order.
    pub fn walk_save(&self, state: &dyn Any, w: &mut StreamWriter) -> Result<()> {
        for f in &self.fields {
            match &f.access {
                FieldAccess::U8(get, _) => w.put_u8(get(state)),
                FieldAccess::U16(get, _) => w.put_u16(get(state)),
                FieldAccess::U32(get, _) => w.put_u32(get(state)),
                FieldAccess::U64(get, _) => w.put_u64(get(state)),
                FieldAccess::Buffer(get, _) => w.put_buf32(&get(state)),
            }
        }
        w.check()
    }

    /// Reads the fields a `wire_version` producer wrote, in declaration
    /// order, skipping fields newer than the stream.
    pub fn walk_load(&self, state: &mut dyn Any, r: &mut StreamReader, wire_version: u32) -> Result<()> {
        if wire_version > self.version_id {
            return Err(Error::UnsupportedVersion(wire_version));
        }
        if wire_version < self.minimum_version_id {
            return Err(Error::UnsupportedVersion(wire_version));
        }
        for f in &self.fields {
            if f.since_version > wire_version {
                continue;
            }
            match &f.access {
                FieldAccess::U8(_, set) => {
                    let v = r.get_u8()?;
                    set(state, v);
                }
                FieldAccess::U16(_, set) => {
                    let v = r.get_u16()?;
                    set(state, v);
                }
                FieldAccess::U32(_, set) => {
                    let v = r.get_u32()?;
                    set(state, v);
                }
                FieldAccess::U64(_, set) => {
                    let v = r.get_u64()?;
                    set(state, v);
                }
                FieldAccess::Buffer(_, set) => {
                    let v = r.get_buf32()?;
                    set(state, v);
                }
            }
        }
        Ok(())
    }
}
