// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The VM-state serialization engine: a registry of per-device state entries,
//! the tagged-section stream framing, the in-band command channel with its
//! return path, and the savevm/loadvm state machines driving iterative
//! multi-phase transfers.

pub mod command;
mod error;
mod load;
mod registry;
mod save;
mod stream;
mod vmstate;

pub use error::Error;
pub use error::Result;
pub use load::CommandHandler;
pub use load::LoadContext;
pub use load::LoadControl;
pub use load::LoadVm;
pub use registry::CompatInfo;
pub use registry::IterateStatus;
pub use registry::MigrateParams;
pub use registry::PendingBytes;
pub use registry::RegisterRequest;
pub use registry::StateEntry;
pub use registry::StateHandler;
pub use registry::StateOps;
pub use registry::StateRegistry;
pub use save::SaveVm;
pub use stream::BufferChannel;
pub use stream::ErrorLatch;
pub use stream::SectionType;
pub use stream::StreamReader;
pub use stream::StreamWriter;
pub use stream::STREAM_MAGIC;
pub use stream::STREAM_VERSION;
pub use stream::STREAM_VERSION_V2;
pub use vmstate::FieldAccess;
pub use vmstate::VmStateDescription;
pub use vmstate::VmStateField;
