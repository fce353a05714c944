//! Channel state: member set and ordered broadcast history.

use crate::message::Message;

/// One channel. Members are client ids in join order; history is every
/// broadcast in delivery order, including the sender's copy.
#[derive(Debug, Default)]
pub struct Channel {
    pub name: String,
    members: Vec<u64>,
    history: Vec<Message>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_member(&mut self, client_id: u64) {
        if !self.members.contains(&client_id) {
            self.members.push(client_id);
        }
    }

    pub fn remove_member(&mut self, client_id: u64) {
        self.members.retain(|&id| id != client_id);
    }

    pub fn has_member(&self, client_id: u64) -> bool {
        self.members.contains(&client_id)
    }

    pub fn members(&self) -> &[u64] {
        &self.members
    }

    /// Append to history and return the member snapshot to deliver to,
    /// excluding `sender` if given. Socket writes happen outside the
    /// broker lock using this snapshot.
    pub fn record_broadcast(&mut self, msg: Message, sender: Option<u64>) -> Vec<u64> {
        self.history.push(msg);
        self.members
            .iter()
            .copied()
            .filter(|&id| Some(id) != sender)
            .collect()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_ordered_and_deduplicated() {
        let mut ch = Channel::new("#agents");
        ch.add_member(3);
        ch.add_member(1);
        ch.add_member(3);
        assert_eq!(ch.members(), &[3, 1]);
        ch.remove_member(3);
        assert_eq!(ch.members(), &[1]);
    }

    #[test]
    fn broadcast_records_history_and_excludes_sender() {
        let mut ch = Channel::new("#agents");
        ch.add_member(1);
        ch.add_member(2);

        let targets = ch.record_broadcast(Message::privmsg("a", "#agents", "hi"), Some(1));
        assert_eq!(targets, vec![2]);
        assert_eq!(ch.history().len(), 1);

        // System broadcasts (no sender) reach everyone.
        let targets = ch.record_broadcast(Message::privmsg("SYSTEM", "#agents", "x y"), None);
        assert_eq!(targets, vec![1, 2]);
        assert_eq!(ch.history().len(), 2);
    }

    #[test]
    fn history_preserves_broadcast_order() {
        let mut ch = Channel::new("#c");
        ch.add_member(1);
        for i in 0..5 {
            ch.record_broadcast(Message::privmsg("a", "#c", &format!("m{i}")), None);
        }
        let texts: Vec<&str> = ch.history().iter().map(|m| m.params[1].as_str()).collect();
        assert_eq!(texts, ["m0", "m1", "m2", "m3", "m4"]);
    }
}
