//! Generic fan-in and fan-out over tokio channels.
//!
//! Every blocking point races against the shared [`CancellationToken`]:
//! once it is cancelled the background tasks drop their senders, which
//! closes the output streams even if nobody reads from them anymore.

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;

/// Capacity of every inter-stage channel. A producer can run at most one
/// item ahead of its consumer.
pub const CHANNEL_CAPACITY: usize = 1;

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Sends `item` unless the token is cancelled first.
///
/// Returns `false` when the item was not delivered, either because of
/// cancellation or because the receiving side is gone. Callers should stop
/// producing in that case.
pub async fn send<T>(cancel: &CancellationToken, tx: &Sender<T>, item: T) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

/// Receives the next item unless the token is cancelled first.
pub async fn recv<T>(cancel: &CancellationToken, rx: &mut Receiver<T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Fans several streams of the same type into one.
///
/// Each input is drained by its own task. The output closes once every input
/// is closed or the token is cancelled.
pub fn merge<T>(cancel: &CancellationToken, inputs: Vec<Receiver<T>>) -> Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = channel();

    for mut input in inputs {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(item) = recv(&cancel, &mut input).await {
                if !send(&cancel, &tx, item).await {
                    return;
                }
            }
        });
    }

    rx
}

/// Duplicates one stream into `n` streams.
///
/// Every item is delivered to all outputs before the next one is read, so
/// the slowest consumer paces the source. An output whose receiver was
/// dropped is skipped from then on. All outputs close together when the
/// input closes, every output is gone, or the token is cancelled.
pub fn tee<T>(cancel: &CancellationToken, mut input: Receiver<T>, n: usize) -> Vec<Receiver<T>>
where
    T: Clone + Send + 'static,
{
    let (mut outputs, rxs): (Vec<Option<Sender<T>>>, Vec<Receiver<T>>) = (0..n)
        .map(|_| {
            let (tx, rx) = channel();
            (Some(tx), rx)
        })
        .unzip();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        while outputs.iter().any(Option::is_some) {
            let Some(item) = recv(&cancel, &mut input).await else {
                return;
            };

            for slot in outputs.iter_mut() {
                let Some(tx) = slot.as_ref() else { continue };
                if !send(&cancel, tx, item.clone()).await {
                    if cancel.is_cancelled() {
                        return;
                    }
                    *slot = None;
                }
            }
        }
    });

    rxs
}
