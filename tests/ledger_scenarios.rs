//! End-to-end transaction scenarios: bootstrap, first transfer, replay,
//! and recursive pending transactions, driven through the full ledger
//! (validation, guest processors, execution engine, account store).

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tempfile::TempDir;

use alder::error::{StoreError, ValidationError};
use alder::ledger::{Ledger, RejectReason, Vote};
use alder::processor::ProcessorRegistry;
use alder::store::AccountStore;
use alder::transaction::Transaction;
use alder::types::{AccountId, Tag};

/// Transfer processor: payload is recipient (32 bytes) followed by the
/// amount (u64 LE). Debits the sender's "balance" key and credits the
/// recipient's, treating a missing balance as zero.
const TRANSFER_GUEST: &str = r#"
    (module
      (import "env" "tx_tag" (func $tx_tag (result i32)))
      (import "env" "tx_sender" (func $tx_sender (param i32)))
      (import "env" "tx_payload" (func $tx_payload (param i32)))
      (import "env" "state_load" (func $state_load (param i32 i32 i32) (result i32)))
      (import "env" "state_read" (func $state_read (param i32)))
      (import "env" "emit_delta" (func $emit_delta (param i32 i32 i32 i32 i32)))
      (memory (export "memory") 1)
      ;; 0..7 key "balance" | 16..48 sender | 64..96 recipient | 96..104 amount
      ;; 112..120 sender balance | 120..128 recipient balance
      (data (i32.const 0) "balance")
      (func (export "tag") (result i32) (i32.const 1))
      (func $load_balance (param $account i32) (param $dst i32)
        (if (i32.ne (call $state_load (local.get $account) (i32.const 0) (i32.const 7))
                    (i32.const -1))
          (then (call $state_read (local.get $dst)))
          (else (i64.store (local.get $dst) (i64.const 0)))))
      (func (export "process")
        (if (i32.ne (call $tx_tag) (i32.const 1)) (then (return)))
        (call $tx_sender (i32.const 16))
        (call $tx_payload (i32.const 64))
        (call $load_balance (i32.const 16) (i32.const 112))
        (i64.store (i32.const 112)
          (i64.sub (i64.load (i32.const 112)) (i64.load (i32.const 96))))
        (call $emit_delta (i32.const 16) (i32.const 0) (i32.const 7)
                          (i32.const 112) (i32.const 8))
        (call $load_balance (i32.const 64) (i32.const 120))
        (i64.store (i32.const 120)
          (i64.add (i64.load (i32.const 120)) (i64.load (i32.const 96))))
        (call $emit_delta (i32.const 64) (i32.const 0) (i32.const 7)
                          (i32.const 120) (i32.const 8))))
"#;

/// Contract processor: its payload is the canonical encoding of one
/// pending transaction, which it re-emits for the engine to apply next.
const CONTRACT_GUEST: &str = r#"
    (module
      (import "env" "tx_tag" (func $tx_tag (result i32)))
      (import "env" "tx_payload_len" (func $tx_payload_len (result i32)))
      (import "env" "tx_payload" (func $tx_payload (param i32)))
      (import "env" "emit_pending" (func $emit_pending (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "tag") (result i32) (i32.const 2))
      (func (export "process")
        (if (i32.ne (call $tx_tag) (i32.const 2)) (then (return)))
        (call $tx_payload (i32.const 0))
        (call $emit_pending (i32.const 0) (call $tx_payload_len))))
"#;

fn ledger_with(guests: &[&str]) -> (TempDir, Arc<Ledger>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(AccountStore::open(&dir.path().join("ledger.redb")).unwrap());
    let mut registry = ProcessorRegistry::new().unwrap();
    for (i, wat) in guests.iter().enumerate() {
        registry
            .register_module(&format!("guest{i}"), wat.as_bytes(), None)
            .unwrap();
    }
    (dir, Arc::new(Ledger::new(store, Arc::new(registry))))
}

fn keypair() -> (SigningKey, AccountId) {
    let keys = SigningKey::generate(&mut OsRng);
    let pk = AccountId(keys.verifying_key().to_bytes());
    (keys, pk)
}

fn transfer_payload(recipient: &AccountId, amount: u64) -> Vec<u8> {
    let mut payload = recipient.as_bytes().to_vec();
    payload.extend_from_slice(&amount.to_le_bytes());
    payload
}

fn balance(store: &AccountStore, account: &AccountId) -> i64 {
    let account = store.load_account(account).unwrap();
    let bytes = account.state.get(b"balance").expect("balance key");
    i64::from_le_bytes(bytes.try_into().expect("8-byte balance"))
}

#[test]
fn nop_bootstrap_is_rejected_on_an_empty_store() {
    let (_dir, ledger) = ledger_with(&[]);
    let (keys, pk) = keypair();

    let mut tx = Transaction::new(&keys, Tag::Nop, Vec::new());
    ledger.attach_sender(&keys, &mut tx).unwrap();

    let vote = ledger.receive_transaction(tx).unwrap();
    assert!(matches!(vote, Vote::Rejected(RejectReason::Execution(_))));
    assert!(matches!(
        ledger.store().load_account(&pk),
        Err(StoreError::NotFound)
    ));
}

#[test]
fn first_transfer_synthesizes_the_sender_and_credits_the_recipient() {
    let (_dir, ledger) = ledger_with(&[TRANSFER_GUEST]);
    let (sender_keys, sender) = keypair();
    let (_, recipient) = keypair();

    let mut tx = Transaction::new(
        &sender_keys,
        Tag::Transfer,
        transfer_payload(&recipient, 10),
    );
    ledger.attach_sender(&sender_keys, &mut tx).unwrap();
    assert_eq!(tx.nonce, 0);

    assert_eq!(ledger.receive_transaction(tx).unwrap(), Vote::Accepted);

    let sender_account = ledger.store().load_account(&sender).unwrap();
    assert_eq!(sender_account.nonce, 1);
    assert_eq!(balance(ledger.store(), &sender), -10);

    let recipient_account = ledger.store().load_account(&recipient).unwrap();
    assert_eq!(recipient_account.nonce, 0);
    assert_eq!(balance(ledger.store(), &recipient), 10);
}

#[test]
fn replayed_transfer_is_rejected_and_the_store_is_unchanged() {
    let (_dir, ledger) = ledger_with(&[TRANSFER_GUEST]);
    let (sender_keys, sender) = keypair();
    let (_, recipient) = keypair();

    let mut tx = Transaction::new(
        &sender_keys,
        Tag::Transfer,
        transfer_payload(&recipient, 10),
    );
    ledger.attach_sender(&sender_keys, &mut tx).unwrap();
    assert_eq!(ledger.receive_transaction(tx.clone()).unwrap(), Vote::Accepted);

    // The identical transaction is already in the graph.
    assert_eq!(
        ledger.receive_transaction(tx).unwrap(),
        Vote::Rejected(RejectReason::Validation(ValidationError::AlreadyReceived))
    );

    // A fresh transaction reusing nonce 0 fails the nonce expectation.
    let mut replay = Transaction::new(
        &sender_keys,
        Tag::Transfer,
        transfer_payload(&recipient, 10),
    );
    replay.attach(
        &sender_keys,
        0,
        ledger.view_id(),
        vec![ledger.root().id],
        1,
    );
    let vote = ledger.receive_transaction(replay).unwrap();
    assert_eq!(
        vote,
        Vote::Rejected(RejectReason::Validation(ValidationError::NonceMismatch {
            sender: sender.to_string(),
            expected: 1,
            got: 0,
        }))
    );

    // Post-scenario state is untouched.
    assert_eq!(ledger.store().load_account(&sender).unwrap().nonce, 1);
    assert_eq!(balance(ledger.store(), &sender), -10);
    assert_eq!(balance(ledger.store(), &recipient), 10);
}

#[test]
fn contract_pending_transfer_applies_in_bfs_order() {
    let (_dir, ledger) = ledger_with(&[TRANSFER_GUEST, CONTRACT_GUEST]);
    let (outer_keys, outer_sender) = keypair();
    let (_, inner_sender) = keypair();
    let (_, inner_recipient) = keypair();

    // The pending transfer the contract will emit: a distinct sender,
    // nonce 0, moving 7 to the recipient. Pending transactions are
    // engine-applied without re-validation, so it carries no signatures.
    let inner = Transaction {
        id: alder::types::TransactionId([0xaa; 32]),
        sender: inner_sender,
        creator: inner_sender,
        creator_signature: alder::types::SignatureBytes::ZERO,
        sender_signature: alder::types::SignatureBytes::ZERO,
        tag: Tag::Transfer,
        payload: transfer_payload(&inner_recipient, 7),
        nonce: 0,
        view_id: 0,
        parents: Vec::new(),
        depth: 0,
    };

    let mut outer = Transaction::new(&outer_keys, Tag::CreateContract, inner.encode());
    ledger.attach_sender(&outer_keys, &mut outer).unwrap();

    assert_eq!(ledger.receive_transaction(outer).unwrap(), Vote::Accepted);

    // Outer: sender synthesized, nonce bumped once, no balance changes.
    let outer_account = ledger.store().load_account(&outer_sender).unwrap();
    assert_eq!(outer_account.nonce, 1);
    assert_eq!(outer_account.state.get(b"balance"), None);

    // Inner: applied after the outer, exactly one nonce increment, and
    // both balance changes visible.
    assert_eq!(ledger.store().load_account(&inner_sender).unwrap().nonce, 1);
    assert_eq!(balance(ledger.store(), &inner_sender), -7);
    assert_eq!(balance(ledger.store(), &inner_recipient), 7);
}

#[test]
fn concurrent_same_nonce_transfers_accept_exactly_one() {
    let (_dir, ledger) = ledger_with(&[TRANSFER_GUEST]);
    let (sender_keys, sender) = keypair();
    let (_, recipient_a) = keypair();
    let (_, recipient_b) = keypair();

    // Two distinct transfers from the same unfunded sender, both built
    // against nonce 0 before either is delivered.
    let mut tx_a = Transaction::new(
        &sender_keys,
        Tag::Transfer,
        transfer_payload(&recipient_a, 10),
    );
    ledger.attach_sender(&sender_keys, &mut tx_a).unwrap();
    let mut tx_b = Transaction::new(
        &sender_keys,
        Tag::Transfer,
        transfer_payload(&recipient_b, 10),
    );
    ledger.attach_sender(&sender_keys, &mut tx_b).unwrap();
    assert_eq!(tx_a.nonce, 0);
    assert_eq!(tx_b.nonce, 0);

    let handles: Vec<_> = [tx_a, tx_b]
        .into_iter()
        .map(|tx| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || ledger.receive_transaction(tx).unwrap())
        })
        .collect();
    let votes: Vec<Vote> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(votes.iter().filter(|vote| vote.is_accepted()).count(), 1);

    // Exactly one application landed: one nonce bump, one debit, and only
    // one credited recipient.
    assert_eq!(ledger.store().load_account(&sender).unwrap().nonce, 1);
    assert_eq!(balance(ledger.store(), &sender), -10);
    let credited = [recipient_a, recipient_b]
        .iter()
        .filter(|recipient| ledger.store().load_account(recipient).is_ok())
        .count();
    assert_eq!(credited, 1);
}

#[test]
fn concurrent_identical_deliveries_apply_once() {
    let (_dir, ledger) = ledger_with(&[TRANSFER_GUEST]);
    let (sender_keys, sender) = keypair();
    let (_, recipient) = keypair();

    let mut tx = Transaction::new(&sender_keys, Tag::Transfer, transfer_payload(&recipient, 10));
    ledger.attach_sender(&sender_keys, &mut tx).unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let tx = tx.clone();
            std::thread::spawn(move || ledger.receive_transaction(tx).unwrap())
        })
        .collect();
    let votes: Vec<Vote> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(votes.iter().filter(|vote| vote.is_accepted()).count(), 1);
    assert!(votes.iter().any(|vote| matches!(
        vote,
        Vote::Rejected(RejectReason::Validation(ValidationError::AlreadyReceived))
    )));

    // The store reflects a single application, not a double debit.
    assert_eq!(ledger.store().load_account(&sender).unwrap().nonce, 1);
    assert_eq!(balance(ledger.store(), &sender), -10);
    assert_eq!(balance(ledger.store(), &recipient), 10);
}

#[test]
fn nonce_moves_by_one_on_accept_and_not_at_all_on_reject() {
    let (_dir, ledger) = ledger_with(&[TRANSFER_GUEST]);
    let (keys, sender) = keypair();
    let (_, recipient) = keypair();

    let mut tx = Transaction::new(&keys, Tag::Transfer, transfer_payload(&recipient, 1));
    ledger.attach_sender(&keys, &mut tx).unwrap();
    assert_eq!(ledger.receive_transaction(tx).unwrap(), Vote::Accepted);
    assert_eq!(ledger.store().load_account(&sender).unwrap().nonce, 1);

    let mut stale = Transaction::new(&keys, Tag::Transfer, transfer_payload(&recipient, 1));
    stale.attach(&keys, 0, ledger.view_id(), vec![ledger.root().id], 1);
    assert!(matches!(
        ledger.receive_transaction(stale).unwrap(),
        Vote::Rejected(_)
    ));
    assert_eq!(ledger.store().load_account(&sender).unwrap().nonce, 1);
}
