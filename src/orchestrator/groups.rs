//! The set of process groups owned by an active session.
//!
//! At most one core-services group, one startup group, one subtest group,
//! one shutdown group and one transient (prestartup / pre / post) group are
//! alive at a time. [`ActiveGroups::stop_all`] is the single teardown path
//! used on every exit from a session.

use tracing::{debug, info};

use crate::launcher::ProcessGroup;

/// Which slot a group occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSlot {
    /// Core/background services.
    Core,
    /// Startup script (kept alive for the rest of the session).
    Startup,
    /// The running subtest script.
    Subtest,
    /// Shutdown script.
    Shutdown,
    /// Prestartup, pre-subtest or post-subtest script.
    Transient,
}

/// Live process-group handles of one session.
#[derive(Default)]
pub struct ActiveGroups {
    core: Option<Box<dyn ProcessGroup>>,
    startup: Option<Box<dyn ProcessGroup>>,
    subtest: Option<Box<dyn ProcessGroup>>,
    shutdown: Option<Box<dyn ProcessGroup>>,
    transient: Option<Box<dyn ProcessGroup>>,
}

impl ActiveGroups {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, slot: GroupSlot) -> &mut Option<Box<dyn ProcessGroup>> {
        match slot {
            GroupSlot::Core => &mut self.core,
            GroupSlot::Startup => &mut self.startup,
            GroupSlot::Subtest => &mut self.subtest,
            GroupSlot::Shutdown => &mut self.shutdown,
            GroupSlot::Transient => &mut self.transient,
        }
    }

    /// Store `group` in `slot`, stopping whatever occupied it before.
    pub async fn insert(&mut self, slot: GroupSlot, group: Box<dyn ProcessGroup>) {
        if let Some(mut previous) = self.slot_mut(slot).replace(group) {
            debug!(?slot, label = previous.label(), "replacing process group");
            previous.stop().await;
        }
    }

    /// Mutable access to the group in `slot`.
    pub fn get_mut(&mut self, slot: GroupSlot) -> Option<&mut Box<dyn ProcessGroup>> {
        self.slot_mut(slot).as_mut()
    }

    /// Stop and release the group in `slot`, if any.
    pub async fn stop(&mut self, slot: GroupSlot) {
        if let Some(mut group) = self.slot_mut(slot).take() {
            debug!(?slot, label = group.label(), "stopping process group");
            group.stop().await;
        }
    }

    /// Number of held handles.
    #[must_use]
    pub fn len(&self) -> usize {
        [
            &self.core,
            &self.startup,
            &self.subtest,
            &self.shutdown,
            &self.transient,
        ]
        .iter()
        .filter(|g| g.is_some())
        .count()
    }

    /// Whether no handles are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance bookkeeping of every held group; called once per tick.
    pub fn poll_all(&mut self) {
        for group in [
            &mut self.core,
            &mut self.startup,
            &mut self.subtest,
            &mut self.shutdown,
            &mut self.transient,
        ]
        .into_iter()
        .flatten()
        {
            group.poll_once();
        }
    }

    /// Stop every held group unconditionally, most recently started first.
    pub async fn stop_all(&mut self) {
        let count = self.len();
        for slot in [
            GroupSlot::Transient,
            GroupSlot::Subtest,
            GroupSlot::Shutdown,
            GroupSlot::Startup,
            GroupSlot::Core,
        ] {
            self.stop(slot).await;
        }
        if count > 0 {
            info!(count, "all process groups stopped");
        }
    }
}
