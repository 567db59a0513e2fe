// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest RAM model for live migration: named, page-granular RAM blocks that
//! can be released back to the OS and tracked with per-page bitmaps.

mod bitmap;
mod guest_ram;

pub use bitmap::PageBitmap;
pub use guest_ram::Error;
pub use guest_ram::GuestRam;
pub use guest_ram::RamBlock;
pub use guest_ram::Result;
