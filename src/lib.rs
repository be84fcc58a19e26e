// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod config;
pub mod control;
pub mod error;
pub mod frame_bus;
pub mod job_pool;
pub mod registry;
pub mod settings;
pub mod stream_ports;
pub mod supervisor;
mod sync;
pub mod wire;
pub mod worker;
