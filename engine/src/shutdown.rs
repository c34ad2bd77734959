// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared shutdown token.  Pollers check it once per loop iteration and
/// every blocking wait in the public API checks it on each wake.
#[derive(Clone, Default)]
pub(crate) struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub(crate) fn new() -> Shutdown {
        Shutdown::default()
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
