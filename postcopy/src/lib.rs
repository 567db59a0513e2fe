// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Postcopy RAM migration: the source-side protocol sequencing and discard
//! batching, and the destination-side state machine with its kernel-assisted
//! page-fault handler.

pub mod dest;
pub mod source;
pub mod userfaultfd;

pub use dest::IncomingState;
pub use dest::PostcopyHandler;
pub use dest::PostcopyIncoming;
pub use source::DiscardSender;
pub use source::PostcopySource;
pub use source::MAX_DISCARDS_PER_COMMAND;
