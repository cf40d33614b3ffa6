//! Query merging: concurrent lookups for the same (name, type, control zone)
//! share one in-flight [`Transmit`].
//!
//! Each slot is reference counted by the handles pointing at it. Within one
//! event-loop iteration only the first sharer to ask for I/O gets the
//! descriptor; the others see the outcome once it has been recorded.

use std::time::Instant;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::proto_utils::{domain_lower, domain_to_dot};
use crate::random::DnsRandom;
use crate::transmit::{IoRequest, Progress, Servers, Transmit, TransmitError, TransmitPolicy};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("all {0} merge slots are in use")]
    PoolFull(usize),
    #[error(transparent)]
    Transmit(#[from] TransmitError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MergeKey {
    name: Vec<u8>,
    qtype: [u8; 2],
    control: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Failed,
    NeedIo,
    NeedGet,
    Got,
}

struct Slot {
    key: MergeKey,
    tx: Transmit,
    refs: usize,
    state: SlotState,
}

/// One reference to a pool slot. Not `Clone`: give it back with
/// [`MergePool::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct MergeHandle(usize);

pub struct MergePool {
    slots: Vec<Option<Slot>>,
    index: FxHashMap<MergeKey, usize>,
    policy: TransmitPolicy,
}

impl MergePool {
    pub fn new(capacity: usize, policy: TransmitPolicy) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: FxHashMap::default(),
            policy,
        }
    }

    /// Join the in-flight query for this key, or start a new one in a free
    /// slot.
    pub fn start(
        &mut self,
        servers: Servers,
        recursive: bool,
        qname: &[u8],
        qtype: [u8; 2],
        control: &[u8],
        rng: &mut DnsRandom,
    ) -> Result<MergeHandle, MergeError> {
        let key = MergeKey {
            name: domain_lower(qname).ok_or(TransmitError::BadName)?,
            qtype,
            control: domain_lower(control).ok_or(TransmitError::BadName)?,
        };

        if let Some(&i) = self.index.get(&key) {
            if let Some(slot) = self.slots[i].as_mut() {
                slot.refs += 1;
                debug!(
                    target = "merge",
                    name = %domain_to_dot(qname),
                    qtype = u16::from_be_bytes(qtype),
                    control = %domain_to_dot(control),
                    refs = slot.refs,
                    "piggyback on in-flight query"
                );
                return Ok(MergeHandle(i));
            }
        }

        let free = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(MergeError::PoolFull(self.slots.len()))?;

        let mut tx = Transmit::new(self.policy.clone());
        tx.start(servers, recursive, qname, qtype, rng)?;
        debug!(
            target = "merge",
            name = %domain_to_dot(qname),
            qtype = u16::from_be_bytes(qtype),
            control = %domain_to_dot(control),
            slot = free,
            "new transmission"
        );

        self.index.insert(key.clone(), free);
        self.slots[free] = Some(Slot {
            key,
            tx,
            refs: 1,
            state: SlotState::NeedIo,
        });
        Ok(MergeHandle(free))
    }

    /// Descriptor to wait on, for the first sharer asking this iteration.
    pub fn io(&mut self, handle: &MergeHandle, deadline: &mut Instant) -> Option<IoRequest> {
        let slot = self.slots.get_mut(handle.0)?.as_mut()?;
        if slot.state != SlotState::NeedIo {
            return None;
        }
        slot.state = SlotState::NeedGet;
        slot.tx.io(deadline)
    }

    pub fn get(
        &mut self,
        handle: &MergeHandle,
        ready: bool,
        now: Instant,
        rng: &mut DnsRandom,
    ) -> Result<Progress, MergeError> {
        let slot = self
            .slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(TransmitError::NoQuery)?;

        match slot.state {
            SlotState::Failed => Err(TransmitError::Exhausted.into()),
            SlotState::NeedIo => Ok(Progress::Pending),
            SlotState::Got => Ok(Progress::Done),
            SlotState::NeedGet => match slot.tx.get(ready, now, rng) {
                Ok(Progress::Pending) => {
                    slot.state = SlotState::NeedIo;
                    Ok(Progress::Pending)
                }
                Ok(Progress::Done) => {
                    slot.state = SlotState::Got;
                    Ok(Progress::Done)
                }
                Err(err) => {
                    slot.state = SlotState::Failed;
                    Err(err.into())
                }
            },
        }
    }

    /// Reply shared by every holder of the slot.
    pub fn packet(&self, handle: &MergeHandle) -> Option<&Bytes> {
        self.slots.get(handle.0)?.as_ref()?.tx.packet()
    }

    /// Drop one reference; the last one closes the transmission.
    pub fn free(&mut self, handle: MergeHandle) {
        let Some(entry) = self.slots.get_mut(handle.0) else {
            return;
        };
        let Some(slot) = entry.as_mut() else {
            return;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            if let Some(slot) = entry.take() {
                self.index.remove(&slot.key);
            }
        }
    }

    pub fn refs(&self, handle: &MergeHandle) -> usize {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .map_or(0, |s| s.refs)
    }

    /// Slots currently holding a transmission.
    pub fn in_flight(&self) -> usize {
        self.index.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
