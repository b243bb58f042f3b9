use raft::prelude::{ConfChangeV2, ConfState, Message};
use raft::{LightReady, RawNode, Ready, SnapshotStatus, StateRole, Storage};

// The consensus algorithm as seen by the node driver. Implemented by the
// raft-rs RawNode. All calls are synchronous, side effects are reported
// through the ready/advance cycle.
pub trait ConsensusCore: Send {
    fn id(&self) -> u64;
    fn leader_id(&self) -> u64;
    fn is_leader(&self) -> bool;
    fn term(&self) -> u64;

    // Index of the last entry handed to the state machine.
    fn applied(&self) -> u64;

    fn tick(&mut self) -> bool;
    fn step(&mut self, message: Message) -> raft::Result<()>;
    fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> raft::Result<()>;
    fn propose_conf_change(&mut self, context: Vec<u8>, change: ConfChangeV2) -> raft::Result<()>;
    fn apply_conf_change(&mut self, change: &ConfChangeV2) -> raft::Result<ConfState>;

    // Whether the applied configuration is joint, i.e., has outgoing voters.
    fn is_joint(&self) -> bool;

    // Whether a proposal of the supplied change would be dropped, either
    // because another change is not applied yet or because it does not fit
    // the current configuration (joint or not).
    fn refuses_conf_change(&self, change: &ConfChangeV2) -> bool;

    fn report_unreachable(&mut self, id: u64);
    fn report_snapshot(&mut self, id: u64, status: SnapshotStatus);
    fn transfer_leader(&mut self, id: u64);

    fn has_ready(&self) -> bool;
    fn ready(&mut self) -> Ready;
    fn advance(&mut self, ready: Ready) -> LightReady;
    fn advance_apply(&mut self);
}

impl<T: Storage + Send> ConsensusCore for RawNode<T> {
    fn id(&self) -> u64 {
        self.raft.id
    }

    fn leader_id(&self) -> u64 {
        self.raft.leader_id
    }

    fn is_leader(&self) -> bool {
        self.raft.state == StateRole::Leader
    }

    fn term(&self) -> u64 {
        self.raft.term
    }

    fn applied(&self) -> u64 {
        self.raft.raft_log.applied
    }

    fn tick(&mut self) -> bool {
        RawNode::tick(self)
    }

    fn step(&mut self, message: Message) -> raft::Result<()> {
        RawNode::step(self, message)
    }

    fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> raft::Result<()> {
        RawNode::propose(self, context, data)
    }

    fn propose_conf_change(&mut self, context: Vec<u8>, change: ConfChangeV2) -> raft::Result<()> {
        RawNode::propose_conf_change(self, context, change)
    }

    fn apply_conf_change(&mut self, change: &ConfChangeV2) -> raft::Result<ConfState> {
        RawNode::apply_conf_change(self, change)
    }

    fn is_joint(&self) -> bool {
        !self
            .raft
            .prs()
            .conf()
            .to_conf_state()
            .get_voters_outgoing()
            .is_empty()
    }

    fn refuses_conf_change(&self, change: &ConfChangeV2) -> bool {
        let leaves_joint = change.get_changes().is_empty();
        self.raft.has_pending_conf() || self.is_joint() != leaves_joint
    }

    fn report_unreachable(&mut self, id: u64) {
        RawNode::report_unreachable(self, id)
    }

    fn report_snapshot(&mut self, id: u64, status: SnapshotStatus) {
        RawNode::report_snapshot(self, id, status)
    }

    fn transfer_leader(&mut self, id: u64) {
        RawNode::transfer_leader(self, id)
    }

    fn has_ready(&self) -> bool {
        RawNode::has_ready(self)
    }

    fn ready(&mut self) -> Ready {
        RawNode::ready(self)
    }

    fn advance(&mut self, ready: Ready) -> LightReady {
        RawNode::advance(self, ready)
    }

    fn advance_apply(&mut self) {
        RawNode::advance_apply(self)
    }
}
