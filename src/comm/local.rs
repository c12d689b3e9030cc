use tokio::sync::mpsc;

use crate::comm::Communicator;

/// Build a group of `size` communicators wired together with in-process
/// channels. Hand one to each task that plays a rank.
pub fn local_group(size: usize) -> Vec<Communicator> {
    let (senders, inboxes): (Vec<_>, Vec<_>) =
        (0..size).map(|_| mpsc::unbounded_channel()).unzip();

    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| Communicator::new(rank, senders.clone(), inbox, Vec::new(), Vec::new()))
        .collect()
}
