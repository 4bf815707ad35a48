//! In-memory duplex link, used by tests and the node simulator.

use tokio::sync::mpsc;

use super::{LinkHandle, LINK_CHANNEL_DEPTH};

/// Creates a connected pair of link endpoints. Frames written to one side
/// arrive on the other, in order, with no framing layer in between.
pub fn pair() -> (LinkHandle, LinkHandle) {
    let (a_tx, b_rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
    let (b_tx, a_rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
    (
        LinkHandle { tx: a_tx, rx: a_rx },
        LinkHandle { tx: b_tx, rx: b_rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_sides_in_order() {
        let (a, mut b) = pair();
        a.tx.send(vec![1]).await.unwrap();
        a.tx.send(vec![2]).await.unwrap();
        assert_eq!(b.rx.recv().await, Some(vec![1]));
        assert_eq!(b.rx.recv().await, Some(vec![2]));

        b.tx.send(vec![3]).await.unwrap();
        drop(b.tx);
        let mut a = a;
        assert_eq!(a.rx.recv().await, Some(vec![3]));
        assert_eq!(a.rx.recv().await, None);
    }
}
