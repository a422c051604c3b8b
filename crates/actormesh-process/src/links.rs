//! C4 — monitors and links (spec §4.4). The bidirectional bookkeeping
//! ("who is watching me", "who am I linked to") lives inside each
//! process's own driver loop (see [`crate::runtime`]); this module is
//! just the public entry points that push the right [`SystemSignal`]s.

use std::sync::Arc;

use crate::ids;
use crate::mailbox::SystemSignal;
use crate::Process;

/// Returned by [`monitor`]. Holds everything [`MonitorRef::demonitor`]
/// needs — no table lookup required on the watcher's side.
#[derive(Clone)]
pub struct MonitorRef {
    pub id: String,
    target: Arc<dyn Process>,
}

impl MonitorRef {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn demonitor(&self) {
        self.target.send_system(SystemSignal::Demonitor {
            id: self.id.clone(),
        });
    }
}

/// One process starts watching another. `target` records `watcher` and
/// will send it a `ProcessDown` signal when it terminates.
pub fn monitor(watcher: Arc<dyn Process>, target: Arc<dyn Process>) -> MonitorRef {
    let id = ids::generate_monitor_id();
    target.send_system(SystemSignal::Monitor {
        id: id.clone(),
        watcher,
    });
    MonitorRef { id, target }
}

/// Returned by [`link`]. Either side may call [`LinkRef::unlink`]; the
/// receiving process cascades the removal to its peer.
#[derive(Clone)]
pub struct LinkRef {
    pub id: String,
    a: Arc<dyn Process>,
}

impl LinkRef {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Removes the link from `a`'s side; `a`'s driver loop cascades the
    /// removal to its peer (spec §4.4: unlink is idempotent and
    /// bidirectional).
    pub fn unlink(&self) {
        self.a.send_system(SystemSignal::Unlink {
            id: self.id.clone(),
        });
    }
}

/// Symmetric link: both `a` and `b` record each other and propagate
/// non-normal exits across the link unless the receiving side traps them.
pub fn link(a: Arc<dyn Process>, b: Arc<dyn Process>) -> LinkRef {
    let id = ids::generate_link_id();
    a.send_system(SystemSignal::Link {
        id: id.clone(),
        peer: b.clone(),
    });
    b.send_system(SystemSignal::Link {
        id: id.clone(),
        peer: a.clone(),
    });
    LinkRef { id, a }
}
