//! Names owned by this host.
//!
//! Every owned name keeps one [Operation] per adapter. An operation moves
//! from `New` through registration (broadcast on B-node adapters, unicast to
//! the WINS servers on H-node adapters) to a registered state, where it stays
//! and refreshes until the name is released:
//!
//!```text
//!  New ──> InRegistrationBroadcast ───────────────> RegisteredBroadcast
//!   │                 ^                                     │
//!   │                 │ (no WINS answer)                    │
//!   └───> InRegistrationUnicast ──> PendingBroadcastFallback│
//!                 │   │                                     │
//!                 │   └──────────────────────────> RegisteredUnicast
//!                 │                                   ^     │
//!                 └──> EndNodeChallenge ──> Claim ────┘     │
//!                                                           v
//!                       Released <── InRelease* <── (conflict) / release
//!```
//!
//! Unicast registration frames in flight are counted per operation, and the
//! sum over all adapters is kept in `pending_total`. The name is only
//! settled (and its registrants answered) once nothing is in flight.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    adapter::{Adapter, AdapterId},
    config::{
        BCAST_REG_TIMEOUT_SECS, CHALLENGE_RETRIES, CHALLENGE_TIMEOUT_SECS, CLAIM_RETRIES,
        MIN_REFRESH_SECS, RELEASE_HOLD_SECS, UCAST_REG_RETRIES, UCAST_REG_TIMEOUT_SECS,
    },
    engine::{Counter, EngineCtx, NameEvent, Requester, TranRange},
    name_daemon::DaemonEvent,
    nbns_parser::{
        NbAddrEntry, NbName, NodeStatusEntry, NsIncoming, NsOutgoing, NsRecord, Opcode, RData,
        RRType, Rcode, NAME_FLAGS_ACT, NB_FLAGS_GROUP,
    },
    Error, Result,
};
use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddrV4},
};

/// The registration state of one name on one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operation {
    New,

    /// A registration request was broadcast; silence means success.
    InRegistrationBroadcast { countdown: u32, batch: TranRange },

    /// Registration requests were sent to the WINS servers, `pending` of
    /// them are not answered yet.
    InRegistrationUnicast {
        countdown: u32,
        retries_left: u32,
        pending: u32,
        batch: TranRange,
    },

    /// The WINS servers did not answer, but another adapter is still
    /// waiting for its own WINS answers.
    PendingBroadcastFallback,

    RegisteredBroadcast,

    /// Registered with a WINS server. `countdown` runs to the next refresh,
    /// `refresh` is the batch of the refresh requests in flight.
    RegisteredUnicast {
        ttl: u32,
        countdown: u32,
        refresh: Option<TranRange>,
    },

    /// A WINS server said `owner` holds the name: ask the owner.
    EndNodeChallenge {
        owner: Ipv4Addr,
        countdown: u32,
        retries_left: u32,
        batch: TranRange,
    },

    /// The owner did not defend the name: register it again with the WINS servers.
    Claim {
        countdown: u32,
        retries_left: u32,
        pending: u32,
        batch: TranRange,
    },

    InReleaseBroadcast { countdown: u32 },

    InReleaseUnicast { countdown: u32 },

    Released,
}

/// The observable state of an [Operation], without its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OperationState {
    New,
    InRegistrationBroadcast,
    InRegistrationUnicast,
    PendingBroadcastFallback,
    RegisteredBroadcast,
    RegisteredUnicast,
    EndNodeChallenge,
    Claim,
    InReleaseBroadcast,
    InReleaseUnicast,
    Released,
}

impl OperationState {
    pub const fn is_registered(&self) -> bool {
        matches!(self, Self::RegisteredBroadcast | Self::RegisteredUnicast)
    }
}

impl Operation {
    fn state(&self) -> OperationState {
        match self {
            Self::New => OperationState::New,
            Self::InRegistrationBroadcast { .. } => OperationState::InRegistrationBroadcast,
            Self::InRegistrationUnicast { .. } => OperationState::InRegistrationUnicast,
            Self::PendingBroadcastFallback => OperationState::PendingBroadcastFallback,
            Self::RegisteredBroadcast => OperationState::RegisteredBroadcast,
            Self::RegisteredUnicast { .. } => OperationState::RegisteredUnicast,
            Self::EndNodeChallenge { .. } => OperationState::EndNodeChallenge,
            Self::Claim { .. } => OperationState::Claim,
            Self::InReleaseBroadcast { .. } => OperationState::InReleaseBroadcast,
            Self::InReleaseUnicast { .. } => OperationState::InReleaseUnicast,
            Self::Released => OperationState::Released,
        }
    }

    /// Unicast registration frames not answered yet.
    const fn pending(&self) -> u32 {
        match self {
            Self::InRegistrationUnicast { pending, .. } | Self::Claim { pending, .. } => *pending,
            _ => 0,
        }
    }

    const fn is_registered(&self) -> bool {
        matches!(self, Self::RegisteredBroadcast | Self::RegisteredUnicast { .. })
    }

    const fn is_registering(&self) -> bool {
        matches!(
            self,
            Self::InRegistrationBroadcast { .. } | Self::InRegistrationUnicast { .. }
        )
    }

    /// Waiting for something before the registration outcome is known.
    const fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::InRegistrationBroadcast { .. }
                | Self::InRegistrationUnicast { .. }
                | Self::PendingBroadcastFallback
                | Self::EndNodeChallenge { .. }
                | Self::Claim { .. }
        )
    }

    const fn is_releasing(&self) -> bool {
        matches!(
            self,
            Self::InReleaseBroadcast { .. } | Self::InReleaseUnicast { .. }
        )
    }

    const fn is_idle(&self) -> bool {
        matches!(self, Self::New | Self::Released)
    }

    /// Registration frames for this operation went out on the wire.
    const fn is_on_wire(&self) -> bool {
        self.is_registered() || self.is_registering() || matches!(self, Self::Claim { .. })
    }

    /// Its frames went to the WINS servers rather than the broadcast address.
    const fn is_unicast(&self) -> bool {
        matches!(
            self,
            Self::InRegistrationUnicast { .. }
                | Self::RegisteredUnicast { .. }
                | Self::EndNodeChallenge { .. }
                | Self::Claim { .. }
                | Self::InReleaseUnicast { .. }
        )
    }

    /// Returns true if the response with `id` belongs to this operation.
    const fn matches(&self, id: u16) -> bool {
        match self {
            Self::InRegistrationBroadcast { batch, .. }
            | Self::InRegistrationUnicast { batch, .. }
            | Self::EndNodeChallenge { batch, .. }
            | Self::Claim { batch, .. } => batch.contains(id),
            Self::RegisteredUnicast {
                refresh: Some(batch),
                ..
            } => batch.contains(id),
            _ => false,
        }
    }

    fn countdown(&self) -> Option<u32> {
        match self {
            Self::InRegistrationBroadcast { countdown, .. }
            | Self::InRegistrationUnicast { countdown, .. }
            | Self::RegisteredUnicast { countdown, .. }
            | Self::EndNodeChallenge { countdown, .. }
            | Self::Claim { countdown, .. }
            | Self::InReleaseBroadcast { countdown }
            | Self::InReleaseUnicast { countdown } => Some(*countdown),
            _ => None,
        }
    }

    /// Decreases the countdown by `elapsed` and returns true if it expired.
    fn advance(&mut self, elapsed: u32) -> bool {
        match self {
            Self::InRegistrationBroadcast { countdown, .. }
            | Self::InRegistrationUnicast { countdown, .. }
            | Self::RegisteredUnicast { countdown, .. }
            | Self::EndNodeChallenge { countdown, .. }
            | Self::Claim { countdown, .. }
            | Self::InReleaseBroadcast { countdown }
            | Self::InReleaseUnicast { countdown } => {
                *countdown = countdown.saturating_sub(elapsed);
                *countdown == 0
            }
            _ => false,
        }
    }

    /// Extends the wait of a unicast registration after a WACK.
    fn extend_wait(&mut self, secs: u32) -> bool {
        match self {
            Self::InRegistrationUnicast { countdown, .. } | Self::Claim { countdown, .. } => {
                *countdown = secs;
                true
            }
            _ => false,
        }
    }
}

/// Refresh at half of the TTL granted by the WINS server.
fn refresh_interval(ttl: u32) -> u32 {
    (ttl / 2).max(MIN_REFRESH_SECS)
}

/// One name owned by this host.
#[derive(Debug)]
pub(crate) struct InternalName {
    name: NbName,
    is_group: bool,

    /// TTL asked for in registration requests.
    ttl: u32,

    /// Number of local registrations of this name not released yet.
    registration_count: u32,

    /// Registrants waiting for the outcome.
    waiters: Vec<Requester>,

    /// Sum of `pending` over all operations.
    pending_total: u32,

    /// Never sent on the wire.
    local_only: bool,

    /// Cleared once another host proved to own the name: no more refreshes
    /// or answers for it.
    advertise: bool,

    /// TTL of the first clean WINS acknowledgement in this registration round.
    wins_ack_ttl: Option<u32>,

    /// Local port bound to this name.
    port: Option<u16>,

    /// Keep the entry after the last release.
    retain: bool,

    ops: BTreeMap<AdapterId, Operation>,
}

impl InternalName {
    fn new(name: NbName, is_group: bool, local_only: bool, ttl: u32) -> Self {
        Self {
            name,
            is_group,
            ttl,
            registration_count: 0,
            waiters: Vec::new(),
            pending_total: 0,
            local_only,
            advertise: !local_only,
            wins_ack_ttl: None,
            port: None,
            retain: false,
            ops: BTreeMap::new(),
        }
    }

    /// Removes the operation on `id`, with its pending frames.
    fn take_op(&mut self, id: AdapterId) -> Option<Operation> {
        let op = self.ops.remove(&id)?;
        self.pending_total = self.pending_total.saturating_sub(op.pending());
        Some(op)
    }

    /// Sets the operation on `id`, with its pending frames.
    fn put_op(&mut self, id: AdapterId, op: Operation) {
        self.pending_total += op.pending();
        if let Some(old) = self.ops.insert(id, op) {
            self.pending_total = self.pending_total.saturating_sub(old.pending());
        }
        debug_assert_eq!(
            self.pending_total,
            self.ops.values().map(Operation::pending).sum::<u32>()
        );
    }

    fn any_op(&self, f: impl Fn(&Operation) -> bool) -> bool {
        self.ops.values().any(f)
    }

    fn is_registered(&self) -> bool {
        self.any_op(Operation::is_registered)
    }

    fn addr_entry(&self, adapter: &Adapter) -> NbAddrEntry {
        let group = if self.is_group { NB_FLAGS_GROUP } else { 0 };
        NbAddrEntry::new(group | adapter.ont_flags(), adapter.ip)
    }

    /// A request for this name with our address entry on `adapter`.
    fn request(&self, adapter: &Adapter, id: u16, opcode: Opcode, broadcast: bool) -> NsOutgoing {
        let ttl = if opcode == Opcode::Release {
            0
        } else {
            self.ttl
        };
        let mut out = NsOutgoing::request(id, opcode, broadcast);
        out.add_question(self.name, RRType::NB);
        out.add_additional(NsRecord::nb(self.name, ttl, self.addr_entry(adapter)));
        out
    }

    /// Broadcasts one request on `adapter`.
    fn send_broadcast(
        &self,
        ctx: &mut EngineCtx,
        adapter: &Adapter,
        opcode: Opcode,
        counter: Counter,
    ) -> TranRange {
        let id = ctx.wire.next_tran_id();
        let out = self.request(adapter, id, opcode, true);
        ctx.wire.send(adapter.id, adapter.broadcast, &out, counter);
        TranRange::single(id)
    }

    /// Sends one request to every WINS server of `adapter`, and returns the
    /// batch and the number of frames.
    fn send_to_wins(
        &self,
        ctx: &mut EngineCtx,
        adapter: &Adapter,
        opcode: Opcode,
        counter: Counter,
    ) -> (TranRange, u32) {
        let mut batch: Option<TranRange> = None;
        let mut count = 0;
        for server in adapter.wins.iter() {
            let id = ctx.wire.next_tran_id();
            let out = self.request(adapter, id, opcode, false);
            ctx.wire.send(adapter.id, *server, &out, counter);
            batch = Some(match batch {
                Some(b) => b.extend(id),
                None => TranRange::single(id),
            });
            count += 1;
        }
        let batch = batch.unwrap_or_else(|| TranRange::single(ctx.wire.next_tran_id()));
        (batch, count)
    }

    fn start_registration(
        &self,
        ctx: &mut EngineCtx,
        adapter: &Adapter,
        multi_homed: bool,
    ) -> Operation {
        if self.local_only {
            trace!("{} is local only on {}", self.name, adapter.id);
            return Operation::RegisteredBroadcast;
        }

        if adapter.wins.is_empty() {
            self.start_broadcast(ctx, adapter, Counter::Register)
        } else {
            let opcode = if multi_homed {
                Opcode::MultiHomedRegistration
            } else {
                Opcode::Registration
            };
            let (batch, pending) = self.send_to_wins(ctx, adapter, opcode, Counter::Register);
            debug!(
                "{}: unicast registration on {} to {} servers",
                self.name,
                adapter.id,
                pending
            );
            Operation::InRegistrationUnicast {
                countdown: UCAST_REG_TIMEOUT_SECS,
                retries_left: UCAST_REG_RETRIES,
                pending,
                batch,
            }
        }
    }

    fn start_broadcast(&self, ctx: &mut EngineCtx, adapter: &Adapter, counter: Counter) -> Operation {
        let batch = self.send_broadcast(ctx, adapter, Opcode::Registration, counter);
        debug!("{}: broadcast registration on {}", self.name, adapter.id);
        Operation::InRegistrationBroadcast {
            countdown: BCAST_REG_TIMEOUT_SECS,
            batch,
        }
    }

    fn start_challenge(&self, ctx: &mut EngineCtx, adapter: &Adapter, owner: Ipv4Addr) -> Operation {
        debug!("{}: challenge owner {} on {}", self.name, owner, adapter.id);
        let id = self.send_challenge(ctx, adapter, owner);
        Operation::EndNodeChallenge {
            owner,
            countdown: CHALLENGE_TIMEOUT_SECS,
            retries_left: CHALLENGE_RETRIES,
            batch: TranRange::single(id),
        }
    }

    fn send_challenge(&self, ctx: &mut EngineCtx, adapter: &Adapter, owner: Ipv4Addr) -> u16 {
        let id = ctx.wire.next_tran_id();
        let mut out = NsOutgoing::request(id, Opcode::Query, false);
        out.add_question(self.name, RRType::NB);
        ctx.wire.send(adapter.id, owner, &out, Counter::Challenge);
        id
    }

    fn start_claim(&self, ctx: &mut EngineCtx, adapter: &Adapter) -> Operation {
        debug!("{}: claim on {}", self.name, adapter.id);
        let (batch, pending) =
            self.send_to_wins(ctx, adapter, Opcode::Registration, Counter::Register);
        Operation::Claim {
            countdown: UCAST_REG_TIMEOUT_SECS,
            retries_left: CLAIM_RETRIES,
            pending,
            batch,
        }
    }

    fn registered_unicast(&self, ctx: &mut EngineCtx, adapter: &Adapter, ttl: u32) -> Operation {
        ctx.wire
            .notify(DaemonEvent::Registered(self.name, adapter.ip));
        Operation::RegisteredUnicast {
            ttl,
            countdown: refresh_interval(ttl),
            refresh: None,
        }
    }

    fn register(&mut self, ctx: &mut EngineCtx, is_group: bool, requester: Requester) {
        if self.registration_count > 0 && self.is_group != is_group {
            requester.answer(NameEvent::RegisterFailed(self.name, Error::NameConflict));
            return;
        }

        if self.any_op(Operation::is_releasing) {
            requester.answer(NameEvent::RegisterFailed(
                self.name,
                Error::NameBeingReleased,
            ));
            return;
        }

        let adapters = ctx.adapters;
        if adapters.is_empty() {
            requester.answer(NameEvent::RegisterFailed(
                self.name,
                e_fmt!("no network adapter"),
            ));
            return;
        }

        self.is_group = is_group;
        self.retain = false;
        self.registration_count += 1;

        let in_flight = self.any_op(Operation::is_in_flight);
        if !in_flight && self.is_registered() {
            trace!("{} already registered", self.name);
            requester.answer(NameEvent::Registered(self.name));
            return;
        }

        if !in_flight {
            // A new registration round.
            self.advertise = !self.local_only;
            self.wins_ack_ttl = None;
        }

        self.waiters.push(requester);

        let multi_homed = adapters.is_multi_homed();
        for id in adapters.snapshot() {
            self.register_on_adapter(ctx, id, multi_homed);
        }
        self.settle(ctx);
    }

    fn register_on_adapter(&mut self, ctx: &mut EngineCtx, id: AdapterId, multi_homed: bool) {
        let adapters = ctx.adapters;
        let Some(adapter) = adapters.get(id) else {
            return;
        };

        let op = self.take_op(id).unwrap_or(Operation::New);
        let next = match op {
            Operation::New | Operation::Released => {
                self.start_registration(ctx, adapter, multi_homed)
            }
            other => other,
        };
        self.put_op(id, next);
    }

    /// Answers the waiters once no operation is in flight.
    fn settle(&mut self, ctx: &mut EngineCtx) {
        if self.waiters.is_empty() || self.any_op(Operation::is_in_flight) {
            return;
        }

        if self.is_registered() {
            debug!("{} registered", self.name);
            for waiter in self.waiters.drain(..) {
                waiter.answer(NameEvent::Registered(self.name));
            }
        } else {
            self.fail_registration(ctx, Error::Timeout);
        }
    }

    /// Answers all waiters negatively, and takes the name off the wire once
    /// no registration of it is left.
    fn fail_registration(&mut self, ctx: &mut EngineCtx, error: Error) {
        self.fail_waiters(error);
        if self.registration_count == 0 {
            self.withdraw(ctx);
        }
    }

    /// Answers all waiters negatively. Their registrations are void.
    fn fail_waiters(&mut self, error: Error) {
        let count = self.waiters.len() as u32;
        for waiter in self.waiters.drain(..) {
            waiter.answer(NameEvent::RegisterFailed(self.name, error.clone()));
        }
        self.registration_count = self.registration_count.saturating_sub(count);
    }

    /// Once no unicast frame is pending, a WINS acknowledgement registers
    /// every operation still registering, otherwise the parked ones fall
    /// back to broadcast.
    fn on_pending_drained(&mut self, ctx: &mut EngineCtx) {
        if self.pending_total > 0 {
            return;
        }

        let adapters = ctx.adapters;
        let ids: Vec<AdapterId> = self.ops.keys().copied().collect();
        for id in ids {
            let Some(adapter) = adapters.get(id) else {
                continue;
            };
            let Some(op) = self.take_op(id) else {
                continue;
            };
            let next = match (op, self.wins_ack_ttl) {
                (
                    Operation::InRegistrationBroadcast { .. }
                    | Operation::InRegistrationUnicast { .. }
                    | Operation::PendingBroadcastFallback,
                    Some(ttl),
                ) => self.registered_unicast(ctx, adapter, ttl),
                (Operation::PendingBroadcastFallback, None) => {
                    if self.advertise && self.registration_count > 0 {
                        self.start_broadcast(ctx, adapter, Counter::Register)
                    } else {
                        Operation::Released
                    }
                }
                (other, _) => other,
            };
            self.put_op(id, next);
        }

        if !self.any_op(Operation::is_in_flight) {
            // The registration round is over.
            self.wins_ack_ttl = None;
        }
    }

    fn on_registration_response(&mut self, ctx: &mut EngineCtx, msg: &NsIncoming) -> bool {
        let Some(id) = self.op_matching(msg.id()) else {
            trace!("{}: no operation for response id {}", self.name, msg.id());
            return false;
        };
        let adapters = ctx.adapters;
        let Some(adapter) = adapters.get(id) else {
            return false;
        };
        let Some(op) = self.take_op(id) else {
            return false;
        };

        let record = msg.first_record();
        let ttl = record.map(|r| r.ttl).unwrap_or(ctx.config.default_ttl);

        if msg.rcode() != Rcode::NoError as u16 {
            debug!(
                "{}: negative response rcode {} on {}",
                self.name,
                msg.rcode(),
                id
            );
            self.lose(ctx, adapter, op);
            self.on_pending_drained(ctx);
            self.settle(ctx);
            return true;
        }

        let next = match op {
            Operation::InRegistrationUnicast {
                countdown,
                retries_left,
                pending,
                batch,
            } => {
                if msg.is_recursion_available() {
                    if self.wins_ack_ttl.is_none() {
                        self.wins_ack_ttl = Some(ttl);
                    }
                    Operation::InRegistrationUnicast {
                        countdown,
                        retries_left,
                        pending: pending.saturating_sub(1),
                        batch,
                    }
                } else {
                    // The server says another node holds the name.
                    let owner = record
                        .and_then(|r| r.addr_entries().first())
                        .map(|e| e.addr);
                    match owner {
                        Some(owner) => self.start_challenge(ctx, adapter, owner),
                        None => Operation::InRegistrationUnicast {
                            countdown,
                            retries_left,
                            pending,
                            batch,
                        },
                    }
                }
            }
            Operation::Claim { .. } => self.registered_unicast(ctx, adapter, ttl),
            Operation::RegisteredUnicast { .. } => Operation::RegisteredUnicast {
                ttl,
                countdown: refresh_interval(ttl),
                refresh: None,
            },
            other => other,
        };
        self.put_op(id, next);
        self.on_pending_drained(ctx);
        self.settle(ctx);
        true
    }

    /// Another host owns the name on `adapter`.
    fn lose(&mut self, ctx: &mut EngineCtx, adapter: &Adapter, op: Operation) {
        let releasing = if op.is_unicast() {
            Operation::InReleaseUnicast {
                countdown: RELEASE_HOLD_SECS,
            }
        } else {
            Operation::InReleaseBroadcast {
                countdown: RELEASE_HOLD_SECS,
            }
        };
        self.put_op(adapter.id, releasing);
        self.advertise = false;
        ctx.wire
            .notify(DaemonEvent::NameConflict(self.name, adapter.ip));
        self.fail_registration(ctx, Error::NameConflict);
    }

    /// Releases every operation: frames go out for those on the wire, and
    /// all of them go back to `New`. Returns true if any was releasable.
    fn withdraw(&mut self, ctx: &mut EngineCtx) -> bool {
        let adapters = ctx.adapters;
        let mut releasable = false;
        let ids: Vec<AdapterId> = self.ops.keys().copied().collect();
        for id in ids {
            let Some(op) = self.take_op(id) else {
                continue;
            };
            if op.is_releasing() || op.is_idle() {
                self.put_op(id, op);
                continue;
            }

            releasable = true;
            if op.is_on_wire() && !self.local_only {
                if let Some(adapter) = adapters.get(id) {
                    if op.is_unicast() && !adapter.wins.is_empty() {
                        self.send_to_wins(ctx, adapter, Opcode::Release, Counter::Release);
                    } else {
                        self.send_broadcast(ctx, adapter, Opcode::Release, Counter::Release);
                    }
                }
            }
            self.put_op(id, Operation::New);
        }
        releasable
    }

    fn release(&mut self, ctx: &mut EngineCtx, requester: Requester, free_slot: bool) {
        if self.registration_count == 0 {
            requester.answer(NameEvent::ReleaseFailed(self.name, Error::NotRegistered));
            return;
        }

        // A pending registration of the same caller is the one released.
        self.registration_count -= 1;
        if let Some(pos) = self.waiters.iter().position(|w| w.same_origin(&requester)) {
            self.waiters.remove(pos);
        }

        if self.registration_count > 0 {
            trace!(
                "{} still has {} registrations",
                self.name,
                self.registration_count
            );
            requester.answer(NameEvent::Released(self.name));
            return;
        }

        for waiter in self.waiters.drain(..) {
            waiter.answer(NameEvent::RegisterFailed(
                self.name,
                Error::NameBeingReleased,
            ));
        }

        let released = self.withdraw(ctx);
        self.retain = !free_slot;
        self.wins_ack_ttl = None;

        if released {
            debug!("{} released", self.name);
            requester.answer(NameEvent::Released(self.name));
        } else {
            requester.answer(NameEvent::ReleaseFailed(self.name, Error::NotRegistered));
        }
    }

    fn tick(&mut self, ctx: &mut EngineCtx, elapsed: u32) {
        let ids: Vec<AdapterId> = self.ops.keys().copied().collect();
        for id in ids {
            let Some(mut op) = self.take_op(id) else {
                continue;
            };
            if op.advance(elapsed) {
                self.expire(ctx, id, op);
            } else {
                self.put_op(id, op);
            }
        }
        self.on_pending_drained(ctx);
        self.settle(ctx);
    }

    fn expire(&mut self, ctx: &mut EngineCtx, id: AdapterId, op: Operation) {
        let adapters = ctx.adapters;
        let Some(adapter) = adapters.get(id) else {
            self.put_op(id, Operation::New);
            return;
        };

        let next = match op {
            Operation::InRegistrationBroadcast { .. } => {
                // No one objected.
                ctx.wire
                    .notify(DaemonEvent::Registered(self.name, adapter.ip));
                Operation::RegisteredBroadcast
            }

            Operation::InRegistrationUnicast {
                retries_left,
                pending: 0,
                batch,
                ..
            } => {
                // Acknowledged, waiting for the other adapters.
                Operation::InRegistrationUnicast {
                    countdown: UCAST_REG_TIMEOUT_SECS,
                    retries_left,
                    pending: 0,
                    batch,
                }
            }

            Operation::InRegistrationUnicast { retries_left, .. }
                if retries_left > 0 && !adapter.wins.is_empty() =>
            {
                let opcode = if adapters.is_multi_homed() {
                    Opcode::MultiHomedRegistration
                } else {
                    Opcode::Registration
                };
                let (batch, pending) =
                    self.send_to_wins(ctx, adapter, opcode, Counter::RegisterResend);
                Operation::InRegistrationUnicast {
                    countdown: UCAST_REG_TIMEOUT_SECS,
                    retries_left: retries_left - 1,
                    pending,
                    batch,
                }
            }

            Operation::InRegistrationUnicast { .. } => {
                if let Some(ttl) = self.wins_ack_ttl {
                    self.registered_unicast(ctx, adapter, ttl)
                } else if self.pending_total > 0 {
                    debug!("{}: park {} for broadcast fallback", self.name, id);
                    Operation::PendingBroadcastFallback
                } else if self.advertise {
                    debug!("{}: no WINS answer, broadcast on {}", self.name, id);
                    self.start_broadcast(ctx, adapter, Counter::Register)
                } else {
                    Operation::Released
                }
            }

            Operation::RegisteredUnicast { ttl, .. } => {
                let refresh = if self.advertise && !adapter.wins.is_empty() {
                    let (batch, _) =
                        self.send_to_wins(ctx, adapter, Opcode::Refresh, Counter::Refresh);
                    Some(batch)
                } else {
                    None
                };
                Operation::RegisteredUnicast {
                    ttl,
                    countdown: refresh_interval(ttl),
                    refresh,
                }
            }

            Operation::EndNodeChallenge {
                owner,
                retries_left,
                batch,
                ..
            } if retries_left > 0 => {
                let id = self.send_challenge(ctx, adapter, owner);
                Operation::EndNodeChallenge {
                    owner,
                    countdown: CHALLENGE_TIMEOUT_SECS,
                    retries_left: retries_left - 1,
                    batch: batch.extend(id),
                }
            }

            Operation::EndNodeChallenge { owner, .. } => {
                debug!("{}: owner {} is silent", self.name, owner);
                self.start_claim(ctx, adapter)
            }

            Operation::Claim { retries_left, .. } if retries_left > 0 => {
                let (batch, pending) = self.send_to_wins(
                    ctx,
                    adapter,
                    Opcode::Registration,
                    Counter::RegisterResend,
                );
                Operation::Claim {
                    countdown: UCAST_REG_TIMEOUT_SECS,
                    retries_left: retries_left - 1,
                    pending,
                    batch,
                }
            }

            Operation::Claim { .. } => {
                debug!("{}: claim on {} got no answer", self.name, id);
                self.put_op(id, Operation::Released);
                self.fail_registration(ctx, Error::Timeout);
                return;
            }

            Operation::InReleaseBroadcast { .. } | Operation::InReleaseUnicast { .. } => {
                Operation::Released
            }

            other => other,
        };
        self.put_op(id, next);
    }

    /// The answer to a challenge query we sent.
    fn on_challenge_response(&mut self, ctx: &mut EngineCtx, msg: &NsIncoming) -> bool {
        let Some(id) = self.op_matching(msg.id()) else {
            return false;
        };
        let adapters = ctx.adapters;
        let (Some(adapter), Some(op)) = (adapters.get(id), self.ops.get(&id)) else {
            return false;
        };
        if !matches!(op, Operation::EndNodeChallenge { .. }) {
            return false;
        }
        let Some(op) = self.take_op(id) else {
            return false;
        };

        let defended = msg.rcode() == Rcode::NoError as u16
            && msg.answers().iter().any(|r| !r.addr_entries().is_empty());
        if defended {
            debug!("{}: owner defended the name", self.name);
            self.lose(ctx, adapter, op);
        } else {
            let claim = self.start_claim(ctx, adapter);
            self.put_op(id, claim);
        }
        self.on_pending_drained(ctx);
        self.settle(ctx);
        true
    }

    fn op_matching(&self, tran_id: u16) -> Option<AdapterId> {
        self.ops
            .iter()
            .find(|(_, op)| op.matches(tran_id))
            .map(|(id, _)| *id)
    }

    /// Address entries to answer a query with.
    fn answer_entries(&self, ctx: &EngineCtx, remote: bool) -> Vec<NbAddrEntry> {
        if remote && (self.local_only || !self.advertise) {
            return Vec::new();
        }
        self.ops
            .iter()
            .filter(|(_, op)| op.is_registered() || op.is_registering())
            .filter_map(|(id, _)| ctx.adapters.get(*id))
            .map(|adapter| self.addr_entry(adapter))
            .collect()
    }

    fn is_reclaimable(&self) -> bool {
        self.registration_count == 0
            && self.waiters.is_empty()
            && !self.retain
            && self.ops.values().all(Operation::is_idle)
    }

    fn next_wake(&self) -> Option<u32> {
        self.ops.values().filter_map(Operation::countdown).min()
    }
}

/// The table of names owned by this host.
#[derive(Debug)]
pub(crate) struct InternalNames {
    slots: Vec<Option<InternalName>>,
    free: Vec<usize>,
    capacity: usize,
}

impl InternalNames {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn get(&self, name: &NbName) -> Option<&InternalName> {
        self.slots.iter().flatten().find(|n| &n.name == name)
    }

    fn get_mut(&mut self, name: &NbName) -> Option<&mut InternalName> {
        self.slots.iter_mut().flatten().find(|n| &n.name == name)
    }

    fn allocate(&mut self, entry: InternalName) -> Result<()> {
        if self.len() >= self.capacity {
            debug!("name table full, cannot add {}", entry.name);
            return Err(Error::TableFull);
        }
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[slot] = Some(entry);
        Ok(())
    }

    /// Registers `name` on every adapter.
    pub(crate) fn register_all_adapters(
        &mut self,
        ctx: &mut EngineCtx,
        name: NbName,
        is_group: bool,
        requester: Requester,
    ) {
        if self.get(&name).is_none() {
            let local_only = name.is_wildcard() || ctx.config.is_local_only_suffix(name.suffix());
            let entry = InternalName::new(name, is_group, local_only, ctx.config.default_ttl);
            if let Err(e) = self.allocate(entry) {
                requester.answer(NameEvent::RegisterFailed(name, e));
                return;
            }
        }

        if let Some(entry) = self.get_mut(&name) {
            entry.register(ctx, is_group, requester);
        }
    }

    /// Releases one registration of `name`.
    pub(crate) fn release_all_adapters(
        &mut self,
        ctx: &mut EngineCtx,
        name: NbName,
        requester: Requester,
        free_slot: bool,
    ) {
        match self.get_mut(&name) {
            Some(entry) => entry.release(ctx, requester, free_slot),
            None => requester.answer(NameEvent::ReleaseFailed(name, Error::NotRegistered)),
        }
    }

    pub(crate) fn on_registration_response(&mut self, ctx: &mut EngineCtx, msg: &NsIncoming) -> bool {
        let Some(name) = msg.subject() else {
            return false;
        };
        match self.get_mut(&name) {
            Some(entry) => entry.on_registration_response(ctx, msg),
            None => {
                trace!("registration response for unknown name {}", name);
                false
            }
        }
    }

    pub(crate) fn on_challenge_response(&mut self, ctx: &mut EngineCtx, msg: &NsIncoming) -> bool {
        self.slots
            .iter_mut()
            .flatten()
            .any(|entry| entry.on_challenge_response(ctx, msg))
    }

    /// A WACK for one of our unicast registrations: wait as long as it says.
    pub(crate) fn on_wack(&mut self, msg: &NsIncoming) -> bool {
        let secs = msg.first_record().map(|r| r.ttl).unwrap_or(0);
        for entry in self.slots.iter_mut().flatten() {
            if let Some(id) = entry.op_matching(msg.id()) {
                if let Some(op) = entry.ops.get_mut(&id) {
                    trace!("{}: WACK {} secs on {}", entry.name, secs, id);
                    return op.extend_wait(secs);
                }
            }
        }
        false
    }

    /// Defends a name we own against a registration request from another host.
    ///
    /// Only B-node adapters defend, and two group registrations never conflict.
    pub(crate) fn check_conflict(
        &self,
        ctx: &mut EngineCtx,
        adapter_id: AdapterId,
        msg: &NsIncoming,
        src: SocketAddrV4,
    ) -> bool {
        let adapters = ctx.adapters;
        let Some(adapter) = adapters.get(adapter_id) else {
            return false;
        };
        if !adapter.is_broadcast_mode() || adapters.is_local_ip(*src.ip()) {
            return false;
        }

        let Some(name) = msg.subject() else {
            return false;
        };
        let Some(entry) = self.get(&name) else {
            return false;
        };
        if entry.local_only || !entry.advertise {
            return false;
        }
        let owned = entry
            .ops
            .get(&adapter_id)
            .map(Operation::is_registered)
            .unwrap_or(false);
        if !owned {
            return false;
        }

        let requested_group = msg
            .first_record()
            .and_then(|r| r.addr_entries().first())
            .map(|e| e.is_group())
            .unwrap_or(false);
        if entry.is_group && requested_group {
            return false;
        }

        let opcode = msg.opcode().unwrap_or(Opcode::Registration);
        let mut out = NsOutgoing::response(msg.id(), opcode, Rcode::Conflict);
        out.add_answer(NsRecord::nb(name, 0, entry.addr_entry(adapter)));
        ctx.wire.send_to(adapter_id, src, &out, Counter::Conflict);
        true
    }

    /// Answers a query for `name` from the names we own. Returns true if
    /// answered positively; a negative answer is only sent with `send_negative`.
    pub(crate) fn answer_query(
        &self,
        ctx: &mut EngineCtx,
        name: NbName,
        requester: &Requester,
        send_negative: bool,
    ) -> bool {
        let entries = self
            .get(&name)
            .map(|entry| entry.answer_entries(ctx, !requester.is_local()))
            .unwrap_or_default();
        let found = !entries.is_empty();

        match requester {
            Requester::Local { .. } => {
                if found {
                    let addrs = entries.iter().map(|e| e.addr).collect();
                    requester.answer(NameEvent::Resolved(name, addrs));
                } else if send_negative {
                    requester.answer(NameEvent::ResolveFailed(name, Error::NameNotFound));
                }
            }
            Requester::Remote {
                addr,
                tran_id,
                adapter,
            } => {
                if found {
                    let mut out = NsOutgoing::response(*tran_id, Opcode::Query, Rcode::NoError);
                    out.add_answer(NsRecord {
                        name,
                        ttl: ctx.config.default_ttl,
                        rdata: RData::Nb(entries),
                    });
                    ctx.wire.send_to(*adapter, *addr, &out, Counter::Respond);
                } else if send_negative {
                    let mut out =
                        NsOutgoing::response(*tran_id, Opcode::Query, Rcode::NameError);
                    out.add_answer(NsRecord {
                        name,
                        ttl: 0,
                        rdata: RData::Other(RRType::NULL as u16, Vec::new()),
                    });
                    ctx.wire.send_to(*adapter, *addr, &out, Counter::Respond);
                }
            }
        }
        found
    }

    /// Answers the wildcard query with every name we own, never negatively.
    pub(crate) fn answer_all(&self, ctx: &mut EngineCtx, requester: &Requester) {
        for entry in self.slots.iter().flatten() {
            if !entry.name.is_wildcard() {
                self.answer_query(ctx, entry.name, requester, false);
            }
        }
    }

    /// Returns true if `name` is registered on some adapter.
    pub(crate) fn owns(&self, name: &NbName) -> bool {
        self.get(name)
            .map(|entry| entry.advertise && entry.is_registered())
            .unwrap_or(false)
    }

    /// The name table for a node status response on `adapter`.
    pub(crate) fn node_status_entries(&self, adapter: &Adapter) -> Vec<NodeStatusEntry> {
        self.slots
            .iter()
            .flatten()
            .filter(|entry| !entry.name.is_wildcard() && entry.is_registered())
            .map(|entry| {
                let group = if entry.is_group { NB_FLAGS_GROUP } else { 0 };
                NodeStatusEntry {
                    name: entry.name,
                    flags: group | adapter.ont_flags() | NAME_FLAGS_ACT,
                }
            })
            .collect()
    }

    pub(crate) fn tick(&mut self, ctx: &mut EngineCtx, elapsed: u32) {
        for entry in self.slots.iter_mut().flatten() {
            entry.tick(ctx, elapsed);
        }
    }

    /// Frees the entries nobody needs any more.
    pub(crate) fn reclaim(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().map(InternalName::is_reclaimable).unwrap_or(false) {
                if let Some(entry) = slot.take() {
                    trace!("free slot {} of {}", i, entry.name);
                }
                self.free.push(i);
            }
        }
    }

    /// Drops every operation on a removed adapter. The names are settled
    /// by [settle_all](Self::settle_all) once the new adapters are in.
    pub(crate) fn release_adapter(&mut self, id: AdapterId) {
        for entry in self.slots.iter_mut().flatten() {
            if entry.take_op(id).is_some() {
                trace!("{}: drop operation on removed {}", entry.name, id);
            }
        }
    }

    /// Answers the registrants of every name with nothing left in flight.
    pub(crate) fn settle_all(&mut self, ctx: &mut EngineCtx) {
        for entry in self.slots.iter_mut().flatten() {
            entry.on_pending_drained(ctx);
            entry.settle(ctx);
        }
    }

    /// Starts registering every active name on a new adapter.
    pub(crate) fn register_new_adapter(&mut self, ctx: &mut EngineCtx, id: AdapterId) {
        let multi_homed = ctx.adapters.is_multi_homed();
        for entry in self.slots.iter_mut().flatten() {
            if entry.registration_count > 0 && !entry.any_op(Operation::is_releasing) {
                entry.register_on_adapter(ctx, id, multi_homed);
            }
        }
    }

    /// Releases all names, for shutdown.
    pub(crate) fn release_everything(&mut self, ctx: &mut EngineCtx) {
        for entry in self.slots.iter_mut().flatten() {
            for waiter in entry.waiters.drain(..) {
                waiter.answer(NameEvent::RegisterFailed(
                    entry.name,
                    Error::NameBeingReleased,
                ));
            }
            entry.registration_count = 0;
            entry.retain = false;
            entry.withdraw(ctx);
        }
    }

    pub(crate) fn set_port(&mut self, name: &NbName, port: u16) -> Result<()> {
        match self.get_mut(name) {
            Some(entry) if entry.registration_count > 0 || entry.retain => {
                entry.port = Some(port);
                Ok(())
            }
            _ => Err(Error::NotRegistered),
        }
    }

    pub(crate) fn port(&self, name: &NbName) -> Option<u16> {
        self.get(name).and_then(|entry| entry.port)
    }

    pub(crate) fn next_wake(&self) -> Option<u32> {
        self.slots.iter().flatten().filter_map(InternalName::next_wake).min()
    }

    pub(crate) fn state(&self, name: &NbName, adapter: AdapterId) -> Option<OperationState> {
        self.get(name)
            .and_then(|entry| entry.ops.get(&adapter))
            .map(Operation::state)
    }

    pub(crate) fn operation_adapters(&self, name: &NbName) -> Vec<AdapterId> {
        self.get(name)
            .map(|entry| entry.ops.keys().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn registration_count(&self, name: &NbName) -> Option<u32> {
        self.get(name).map(|entry| entry.registration_count)
    }

    pub(crate) fn pending_total(&self, name: &NbName) -> Option<u32> {
        self.get(name).map(|entry| entry.pending_total)
    }
}

#[cfg(test)]
mod tests {
    use super::{refresh_interval, Operation};
    use crate::{config::MIN_REFRESH_SECS, engine::TranRange};
    use test_log::test;

    #[test]
    fn test_refresh_interval() {
        assert_eq!(refresh_interval(300_000), 150_000);
        assert_eq!(refresh_interval(10), MIN_REFRESH_SECS);
        assert_eq!(refresh_interval(0), MIN_REFRESH_SECS);
    }

    #[test]
    fn test_wack_extends_unicast_wait_only() {
        let mut op = Operation::InRegistrationUnicast {
            countdown: 2,
            retries_left: 2,
            pending: 1,
            batch: TranRange::single(7),
        };
        assert!(op.matches(7));
        assert!(op.extend_wait(60));
        assert!(!op.advance(2));
        assert_eq!(op.countdown(), Some(58));
        assert_eq!(op.pending(), 1);

        let mut op = Operation::InRegistrationBroadcast {
            countdown: 1,
            batch: TranRange::single(8),
        };
        assert!(!op.extend_wait(60));
        assert!(op.advance(1));

        let mut op = Operation::RegisteredBroadcast;
        assert!(!op.advance(100));
        assert!(!op.matches(8));
    }
}
