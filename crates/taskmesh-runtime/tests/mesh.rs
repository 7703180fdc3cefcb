use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use taskmesh_dispatch::{AcceptAll, WorkerRegistry};
use taskmesh_payments::{SealedBatch, verify, verify_batch};
use taskmesh_runtime::transports::{ChannelSink, EchoExecutor};
use taskmesh_runtime::{Identity, ManagerNode, NodeConfig, WorkerNode};
use taskmesh_storage::{KvStore, MemoryStore};
use taskmesh_tasks::TaskStore;
use taskmesh_types::{
    MeshError, PeerId, Recipient, TaskEvent, TaskEventKind, TaskSpec, TaskState,
};

fn payment_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    key[0] = 42;
    key
}

fn config(batch_size: usize) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.channel_capacity = 64;
    config.payments.batch_size = batch_size;
    config
}

struct Mesh {
    manager: Arc<ManagerNode>,
    worker: Arc<WorkerNode>,
    batches: mpsc::Receiver<SealedBatch>,
}

/// One manager and one worker wired back to back through in-memory pumps.
async fn mesh(batch_size: usize) -> Mesh {
    let (batch_tx, batches) = mpsc::channel(8);
    let manager_store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let key = payment_key();
    let (manager, mut to_workers) = ManagerNode::start(
        &config(batch_size),
        manager_store,
        Identity::from_bytes(&[1; 32], Some(&key[..])).unwrap(),
        Arc::new(AcceptAll),
        Arc::new(ChannelSink(batch_tx)),
    )
    .await
    .unwrap();
    let manager = Arc::new(manager);
    let manager_key = manager
        .settlement()
        .unwrap()
        .settlement()
        .unwrap()
        .public_key();

    let (worker, mut to_manager) = WorkerNode::start(
        Arc::new(MemoryStore::new()),
        Identity::from_bytes(&[2; 32], None).unwrap(),
        Arc::new(EchoExecutor),
        manager_key,
        Recipient::new([7; 32]),
        64,
    )
    .await
    .unwrap();
    let worker = Arc::new(worker);

    let (m, w) = (manager.clone(), worker.clone());
    tokio::spawn(async move {
        while let Some(message) = to_manager.recv().await {
            if let Err(e) = m.handle(w.peer_id(), message).await {
                eprintln!("manager rejected message: {e}");
            }
        }
    });
    let w = worker.clone();
    tokio::spawn(async move {
        while let Some((_peer, message)) = to_workers.recv().await {
            if let Err(e) = w.handle(message).await {
                eprintln!("worker rejected message: {e}");
            }
        }
    });

    Mesh {
        manager,
        worker,
        batches,
    }
}

async fn wait_for_nonce(worker: &WorkerNode, nonce: u64) {
    timeout(Duration::from_secs(10), async {
        while worker.runner().unwrap().last_nonce().await < nonce {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never received the payments");
}

#[tokio::test]
async fn test_tasks_are_paid_in_a_verified_batch() {
    let mut mesh = mesh(3).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let spec = TaskSpec::new("label", 5).with_data(serde_json::json!({ "item": i }));
        ids.push(mesh.manager.submit_task(spec).await.unwrap());
    }

    let batch = timeout(Duration::from_secs(10), mesh.batches.recv())
        .await
        .expect("no batch sealed")
        .unwrap();
    assert!(verify_batch(&batch.proof, &batch.inputs));
    assert_eq!(batch.inputs.credits.len(), 3);
    assert_eq!(batch.inputs.total_value(), 15);

    wait_for_nonce(&mesh.worker, 3).await;
    let runner = mesh.worker.runner().unwrap();
    let received = runner.payments().await.unwrap();
    assert_eq!(
        received.iter().map(|p| p.credit.nonce).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    let manager_key = mesh
        .manager
        .settlement()
        .unwrap()
        .settlement()
        .unwrap()
        .public_key();
    assert!(received.iter().all(|p| verify(&manager_key, p)));
    assert!(received.iter().all(|p| p.credit.recipient == Recipient::new([7; 32])));

    let pool = mesh.manager.worker_pool().unwrap();
    for id in ids {
        assert_eq!(pool.task_state(id).await.unwrap(), TaskState::Validated);
    }

    mesh.worker.shutdown().await;
    mesh.manager.shutdown().await;
}

#[tokio::test]
async fn test_replayed_payment_is_rejected_by_worker() {
    let mut mesh = mesh(1).await;
    mesh.manager
        .submit_task(TaskSpec::new("label", 9))
        .await
        .unwrap();

    let batch = timeout(Duration::from_secs(10), mesh.batches.recv())
        .await
        .expect("no batch sealed")
        .unwrap();
    wait_for_nonce(&mesh.worker, 1).await;

    let replay = taskmesh_types::ManagerMessage::Payment {
        payment: batch.payments[0],
        batch_id: batch.proof.id,
    };
    let err = mesh.worker.handle(replay).await.unwrap_err();
    assert!(matches!(err, MeshError::PaymentRejected(_)));
    assert_eq!(mesh.worker.runner().unwrap().payments().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_manager_without_payment_key_fails_to_start() {
    let (batch_tx, _batches) = mpsc::channel(1);
    let err = ManagerNode::start(
        &config(4),
        Arc::new(MemoryStore::new()),
        Identity::from_bytes(&[1; 32], None).unwrap(),
        Arc::new(AcceptAll),
        Arc::new(ChannelSink(batch_tx)),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(
        err,
        MeshError::TransportInit {
            name: "settlement",
            ..
        }
    ));
}

#[tokio::test]
async fn test_restart_credits_validated_task_missing_from_ledger() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let worker = PeerId::new("w1");
    WorkerRegistry::new(store.clone())
        .register(&worker, Recipient::new([7; 32]))
        .await
        .unwrap();

    // Validated before the manager went down, never credited.
    let tasks = TaskStore::open(store.clone()).await.unwrap();
    let task_id = tasks
        .create(TaskSpec::new("label", 11), 0, None)
        .await
        .unwrap()
        .id();
    let now = chrono::Utc::now();
    for kind in [
        TaskEventKind::Assigned {
            worker: worker.clone(),
            deadline: now + chrono::Duration::seconds(30),
        },
        TaskEventKind::Submitted {
            result: serde_json::json!({ "ok": true }),
            validation_deadline: now + chrono::Duration::seconds(60),
        },
        TaskEventKind::Validated,
    ] {
        tasks.append(task_id, TaskEvent::new(kind)).await.unwrap();
    }
    drop(tasks);

    let (batch_tx, _batches) = mpsc::channel(1);
    let key = payment_key();
    let (manager, _outbound) = ManagerNode::start(
        &config(8),
        store,
        Identity::from_bytes(&[1; 32], Some(&key[..])).unwrap(),
        Arc::new(AcceptAll),
        Arc::new(ChannelSink(batch_tx)),
    )
    .await
    .unwrap();
    let ledger = manager.settlement().unwrap().settlement().unwrap().ledger();
    assert!(ledger.is_credited(&worker, task_id).await);
    assert_eq!(ledger.pending_for(&worker).await, 1);
    manager.shutdown().await;
}
