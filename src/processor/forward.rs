// ABOUTME: Forwarding combinator for iterable-expanding inputs
// ABOUTME: Expands each bound tuple over the Cartesian product of its each-positions

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::ControlSignal;
use crate::task::Value;

/// Cartesian product over value groups: one output row per combination,
/// preserving group order within each row.
pub fn cartesian(groups: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let mut rows: Vec<Vec<Value>> = vec![Vec::new()];
    for group in groups {
        let mut next = Vec::with_capacity(rows.len() * group.len().max(1));
        for row in &rows {
            for item in group {
                let mut extended = row.clone();
                extended.push(item.clone());
                next.push(extended);
            }
        }
        rows = next;
    }
    rows
}

/// Expand one input tuple over its each-positions: values at marked
/// positions are normalized to their item lists, all other positions stay
/// fixed, and one tuple per combination is produced.
pub fn expand_tuple(tuple: Vec<Value>, each_positions: &[usize]) -> Vec<Vec<Value>> {
    let groups: Vec<Vec<Value>> = tuple
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            if each_positions.contains(&i) {
                value.into_items()
            } else {
                vec![value]
            }
        })
        .collect();
    cartesian(&groups)
}

/// Spawn the forwarding operator ahead of a processor with each-inputs.
///
/// It consumes exactly one tuple from the upstream receivers (its control
/// channel is pre-seeded with a single proceed followed by poison), expands
/// it, and feeds every combination into the processor's internal queues.
pub fn spawn_forwarder(
    mut upstream: Vec<mpsc::Receiver<Value>>,
    each_positions: Vec<usize>,
    downstream: Vec<mpsc::Sender<Value>>,
    mut control: mpsc::Receiver<ControlSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match control.recv().await {
                Some(ControlSignal::Proceed) => {}
                Some(ControlSignal::Poison) | None => break,
            }

            let mut tuple = Vec::with_capacity(upstream.len());
            let mut closed = false;
            for rx in upstream.iter_mut() {
                match rx.recv().await {
                    Some(value) => tuple.push(value),
                    None => {
                        closed = true;
                        break;
                    }
                }
            }
            if closed {
                break;
            }

            let combinations = expand_tuple(tuple, &each_positions);
            debug!("Forwarding {} expanded combinations", combinations.len());
            for combination in combinations {
                for (value, tx) in combination.into_iter().zip(downstream.iter()) {
                    if tx.send(value).await.is_err() {
                        return;
                    }
                }
            }
        }
        // Dropping the downstream senders closes the processor's queues.
    })
}

/// Pre-seed a forwarder control channel: one proceed, then poison.
pub fn seeded_control() -> (mpsc::Sender<ControlSignal>, mpsc::Receiver<ControlSignal>) {
    let (tx, rx) = mpsc::channel(2);
    tx.try_send(ControlSignal::Proceed).expect("channel has capacity");
    tx.try_send(ControlSignal::Poison).expect("channel has capacity");
    (tx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartesian_product() {
        let rows = cartesian(&[
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::str("a"), Value::str("b")],
        ]);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], vec![Value::Int(1), Value::str("a")]);
        assert_eq!(rows[3], vec![Value::Int(2), Value::str("b")]);
    }

    #[test]
    fn test_expand_tuple_only_each_positions() {
        let tuple = vec![
            Value::str("fixed"),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        ];
        let rows = expand_tuple(tuple, &[1]);
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row[0], Value::str("fixed"));
            assert_eq!(row[1], Value::Int(i as i64 + 1));
        }
    }

    #[test]
    fn test_expand_scalar_each_value() {
        // A non-list value at an each-position behaves as a singleton.
        let rows = expand_tuple(vec![Value::Int(7)], &[0]);
        assert_eq!(rows, vec![vec![Value::Int(7)]]);
    }

    #[tokio::test]
    async fn test_forwarder_runs_exactly_once() {
        let (up_tx, up_rx) = mpsc::channel(8);
        let (down_tx, mut down_rx) = mpsc::channel(8);
        let (_ctrl_tx, ctrl_rx) = seeded_control();

        let handle = spawn_forwarder(vec![up_rx], vec![0], vec![down_tx], ctrl_rx);

        up_tx
            .send(Value::List(vec![Value::Int(1), Value::Int(2)]))
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(v) = down_rx.recv().await {
            received.push(v);
        }
        assert_eq!(received, vec![Value::Int(1), Value::Int(2)]);
        handle.await.unwrap();
    }
}
