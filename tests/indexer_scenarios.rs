mod common;

use common::*;
use ethers::types::{Address, U256};
use pool_indexer::chain_reader::MemberInfo;
use pool_indexer::datastore::{Datastore, MemoryDatastore, TableCounts};
use pool_indexer::error::IndexerError;
use pool_indexer::events::EventKind;
use pool_indexer::indexer::{Indexer, IndexerState, TickOutcome};
use pool_indexer::types::{address_to_string, RequestStatus, RequestType, TxKind};
use std::sync::Arc;
use tokio::sync::watch;

type TestIndexer = Indexer<MockChain, MemoryDatastore>;

fn setup(start_block: u64, head: u64) -> (Arc<MockChain>, Arc<MemoryDatastore>, TestIndexer) {
    let chain = Arc::new(MockChain::new(head));
    let store = Arc::new(MemoryDatastore::new());
    let indexer = Indexer::new(chain.clone(), store.clone(), test_config(start_block));
    (chain, store, indexer)
}

fn pool_key() -> String {
    address_to_string(addr(POOL))
}

fn advanced(outcome: TickOutcome) -> pool_indexer::indexer::TickReport {
    match outcome {
        TickOutcome::Advanced(report) => report,
        other => panic!("expected an advanced tick, got {:?}", other),
    }
}

/// Pool created at 101, Alice deposits 100 USDC at 103, a request is created at 104.
fn script_pool_lifecycle(chain: &MockChain) {
    chain.deploy_pool(addr(POOL), "Dev Fund");
    chain.push_log(pool_created_log(addr(POOL), "Dev Fund", 101, 0));

    chain.set_total_deposited(addr(POOL), usdc(1100));
    chain.set_member(
        addr(POOL),
        addr(ALICE),
        MemberInfo {
            is_active: true,
            is_guardian: false,
            joined_at: U256::from(1_700_000_000u64),
        },
        ether(100),
    );
    chain.push_log(deposited_log(addr(POOL), addr(ALICE), usdc(100), ether(100), 103, 2));

    chain.set_request(addr(POOL), funding_request(0, addr(ALICE), usdc(500), 1));
    chain.push_log(request_created_log(addr(POOL), 0, addr(ALICE), usdc(500), 104, 1));
}

#[tokio::test]
async fn test_pool_created_is_indexed_with_config() {
    let (chain, store, mut indexer) = setup(100, 101);
    script_pool_lifecycle(&chain);

    let report = advanced(indexer.run_once().await.unwrap());
    assert_eq!((report.from, report.to), (101, 101));
    assert_eq!(report.new_pools, 1);

    let pool = store.pool(&pool_key()).await.unwrap().unwrap();
    assert_eq!(pool.name, "Dev Fund");
    assert_eq!(pool.quorum_bps, 5000);
    assert_eq!(pool.approval_bps, 6000);
    assert!(pool.is_active);
    assert_eq!(pool.deposit_token_symbol, "USDC");
    assert_eq!(pool.deposit_token_decimals, 6);
    assert_eq!(pool.min_deposit, "10");
    assert_eq!(pool.admin_address, address_to_string(addr(ADMIN)));
    assert_eq!(pool.chain_id, 84532);
    assert!(pool.created_tx.is_some());

    let checkpoint = store.load_checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.last_block, 101);
    assert_eq!(checkpoint.known_pools, vec![pool_key()]);
}

#[tokio::test]
async fn test_deposit_overwrites_pool_total_and_member_shares() {
    let (chain, store, mut indexer) = setup(100, 103);
    script_pool_lifecycle(&chain);

    indexer.run_once().await.unwrap();

    let pool = store.pool(&pool_key()).await.unwrap().unwrap();
    assert_eq!(pool.total_deposited, "1100");

    let member = store
        .member(&pool_key(), &address_to_string(addr(ALICE)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(member.shares, "100");
    assert!(member.is_active);
    assert!(!member.is_guardian);
    assert_eq!(member.joined_at.map(|t| t.timestamp()), Some(1_700_000_000));

    let txs = store.transactions();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].tx_type, TxKind::Deposit);
    assert_eq!(txs[0].amount, "100");
    assert_eq!(txs[0].block_number, 103);
    assert_eq!(txs[0].log_index, 2);
}

#[tokio::test]
async fn test_request_created_is_voting_grant() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);

    indexer.run_once().await.unwrap();

    let request = store.request(&pool_key(), 0).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Voting);
    assert_eq!(request.request_type, RequestType::Grant);
    assert_eq!(request.amount, "500000000");
    assert_eq!(request.title, "Community garden");
    assert_eq!(request.requester_address, address_to_string(addr(ALICE)));
    assert!(request.voting_ends_at.is_some());
    assert!(request.funded_at.is_none());
}

#[tokio::test]
async fn test_replayed_range_leaves_identical_rows() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);

    // every row lands but the checkpoint does not: the range is replayed
    store.set_fail_checkpoint(true);
    let err = indexer.run_once().await.unwrap_err();
    assert!(matches!(err, IndexerError::Datastore(_)));
    assert_eq!(indexer.state(), IndexerState::FailedTick);
    assert_eq!(indexer.last_block(), 100);
    let after_first = store.counts().await.unwrap();
    let pool_first = store.pool(&pool_key()).await.unwrap();

    store.set_fail_checkpoint(false);
    let report = advanced(indexer.run_once().await.unwrap());
    assert_eq!(report.from, 101);

    assert_eq!(store.counts().await.unwrap(), after_first);
    assert_eq!(
        after_first,
        TableCounts {
            pools: 1,
            members: 1,
            requests: 1,
            votes: 0,
            transactions: 1,
        }
    );
    assert_eq!(store.pool(&pool_key()).await.unwrap(), pool_first);
}

#[tokio::test]
async fn test_rpc_failure_keeps_checkpoint_and_retries_same_range() {
    let (chain, store, mut indexer) = setup(100, 102);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().last_block, 102);

    chain.set_head(110);
    chain.fail("eth_getLogs");
    let err = indexer.run_once().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().last_block, 102);
    assert_eq!(indexer.last_block(), 102);

    chain.heal("eth_getLogs");
    let report = advanced(indexer.run_once().await.unwrap());
    assert_eq!((report.from, report.to), (103, 110));
    let (_, from, to) = chain.log_queries().last().cloned().unwrap();
    assert_eq!((from, to), (103, 110));
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().last_block, 110);
}

#[tokio::test]
async fn test_datastore_failure_does_not_advance_checkpoint() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);

    store.set_fail_writes(true);
    assert!(indexer.run_once().await.is_err());
    assert!(store.load_checkpoint().await.unwrap().is_none());
    assert_eq!(store.counts().await.unwrap(), TableCounts::default());

    store.set_fail_writes(false);
    indexer.run_once().await.unwrap();
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().last_block, 104);
}

#[tokio::test]
async fn test_bootstrap_tracks_factory_pools_created_before_start() {
    let (chain, store, mut indexer) = setup(500, 510);
    let old_pool = addr(0x01d);
    chain.deploy_pool(old_pool, "Legacy Pool");
    chain.with(|s| s.factory_pools = vec![old_pool]);
    chain.set_member(old_pool, addr(BOB), MemberInfo::default(), U256::zero());
    chain.push_log(withdrawn_log(old_pool, addr(BOB), usdc(5), ether(5), 505, 0));

    indexer.run_once().await.unwrap();

    assert!(indexer.registry().contains(&old_pool));
    let pool = store.pool(&address_to_string(old_pool)).await.unwrap().unwrap();
    assert_eq!(pool.name, "Legacy Pool");
    assert!(pool.created_tx.is_none());

    let member = store
        .member(&address_to_string(old_pool), &address_to_string(addr(BOB)))
        .await
        .unwrap()
        .unwrap();
    assert!(!member.is_active);
    assert!(member.joined_at.is_none());
    assert_eq!(store.transactions()[0].tx_type, TxKind::Withdraw);
    assert_eq!(store.transactions()[0].amount, "5");
}

#[tokio::test]
async fn test_pool_created_and_used_in_same_batch() {
    let (chain, store, mut indexer) = setup(100, 200);
    script_pool_lifecycle(&chain);

    let report = advanced(indexer.run_once().await.unwrap());
    assert_eq!(report.events, 3);

    // the new pool was queried for its own logs in the same tick
    let queried_pool = chain
        .log_queries()
        .iter()
        .any(|(addresses, from, _)| addresses == &vec![addr(POOL)] && *from == 101);
    assert!(queried_pool);
    assert!(store.request(&pool_key(), 0).await.unwrap().is_some());
}

#[tokio::test]
async fn test_state_is_reread_not_patched() {
    let (chain, store, mut indexer) = setup(100, 103);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();

    // Alice withdraws 40 USDC; the contract now reports 1060 total and 60 shares.
    chain.set_total_deposited(addr(POOL), usdc(1060));
    chain.set_member(
        addr(POOL),
        addr(ALICE),
        MemberInfo {
            is_active: true,
            is_guardian: true,
            joined_at: U256::from(1_700_000_000u64),
        },
        ether(60),
    );
    chain.push_log(withdrawn_log(addr(POOL), addr(ALICE), usdc(40), ether(40), 120, 0));
    chain.set_head(120);
    // the request at 104 is in range too
    indexer.run_once().await.unwrap();

    let pool = store.pool(&pool_key()).await.unwrap().unwrap();
    assert_eq!(pool.total_deposited, "1060");
    assert!(pool.created_tx.is_some());
    let member = store
        .member(&pool_key(), &address_to_string(addr(ALICE)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(member.shares, "60");
    assert!(member.is_guardian);
}

#[tokio::test]
async fn test_vote_support_and_weight_come_from_log_data() {
    let (chain, store, mut indexer) = setup(100, 130);
    script_pool_lifecycle(&chain);
    let mut request = funding_request(0, addr(ALICE), usdc(500), 1);
    request.no_votes = ether(25);
    chain.set_request(addr(POOL), request);
    chain.push_log(vote_cast_log(addr(POOL), 0, addr(BOB), false, ether(25), 130, 4));

    indexer.run_once().await.unwrap();

    let votes = store.votes_for(&pool_key(), 0).await.unwrap();
    assert_eq!(votes.len(), 1);
    assert!(!votes[0].support);
    assert_eq!(votes[0].weight, ether(25).to_string());
    assert_eq!(votes[0].voter_address, address_to_string(addr(BOB)));

    let row = store.request(&pool_key(), 0).await.unwrap().unwrap();
    assert_eq!(row.no_votes, ether(25).to_string());
}

#[tokio::test]
async fn test_request_funded_records_fund_transaction() {
    let (chain, store, mut indexer) = setup(100, 140);
    script_pool_lifecycle(&chain);
    let mut request = funding_request(0, addr(ALICE), usdc(500), 4);
    request.funded_at = U256::from(1_700_100_000u64);
    chain.set_request(addr(POOL), request);
    chain.set_total_deposited(addr(POOL), usdc(600));
    chain.push_log(request_funded_log(addr(POOL), 0, addr(ALICE), usdc(500), 140, 0));

    indexer.run_once().await.unwrap();

    let row = store.request(&pool_key(), 0).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Funded);
    assert!(row.funded_at.is_some());
    let fund = store
        .transactions()
        .into_iter()
        .find(|t| t.tx_type == TxKind::Fund)
        .unwrap();
    assert_eq!(fund.amount, "500");
    assert_eq!(fund.address, address_to_string(addr(ALICE)));
    assert_eq!(
        store.pool(&pool_key()).await.unwrap().unwrap().total_deposited,
        "600"
    );
}

#[tokio::test]
async fn test_token_metadata_failure_falls_back() {
    let (chain, store, mut indexer) = setup(100, 101);
    script_pool_lifecycle(&chain);
    chain.fail("symbol");

    indexer.run_once().await.unwrap();

    let pool = store.pool(&pool_key()).await.unwrap().unwrap();
    assert_eq!(pool.deposit_token_symbol, "UNKNOWN");
    assert_eq!(pool.deposit_token_decimals, 18);
    // 10e6 base units read with 18 decimals
    assert_eq!(pool.min_deposit, "0.00000000001");
}

#[tokio::test]
async fn test_batches_are_capped_and_confirmations_respected() {
    let chain = Arc::new(MockChain::new(3_600));
    let store = Arc::new(MemoryDatastore::new());
    let mut config = test_config(0);
    config.batch_size = 1_000;
    config.confirmations = 100;
    let mut indexer = Indexer::new(chain.clone(), store.clone(), config);

    let first = advanced(indexer.run_once().await.unwrap());
    assert_eq!((first.from, first.to, first.head), (1, 1_000, 3_500));
    assert_eq!(indexer.state(), IndexerState::Syncing);

    for _ in 0..3 {
        indexer.run_once().await.unwrap();
    }
    assert_eq!(indexer.last_block(), 3_500);
    assert_eq!(indexer.state(), IndexerState::Idle);

    let outcome = indexer.run_once().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Idle {
            last_block: 3_500,
            head: 3_500
        }
    );
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();
    drop(indexer);

    chain.set_head(150);
    let mut restarted: TestIndexer = Indexer::new(chain.clone(), store.clone(), test_config(100));
    restarted.start().await.unwrap();
    assert_eq!(restarted.last_block(), 104);
    assert!(restarted.registry().contains(&addr(POOL)));

    let report = advanced(restarted.run_once().await.unwrap());
    assert_eq!(report.from, 105);

    // a lower start_block never rewinds persisted progress
    let rewound: TestIndexer = Indexer::new(chain.clone(), store.clone(), test_config(0));
    assert_eq!(rewound.status().await.unwrap().last_block, 150);
}

#[tokio::test]
async fn test_stored_checkpoint_beats_higher_start_block() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();
    drop(indexer);

    // a deposit between the checkpoint and the configured start block
    chain.set_total_deposited(addr(POOL), usdc(1200));
    chain.push_log(deposited_log(addr(POOL), addr(ALICE), usdc(100), ether(100), 150, 0));
    chain.set_head(160);

    let mut restarted: TestIndexer = Indexer::new(chain.clone(), store.clone(), test_config(200));
    let report = advanced(restarted.run_once().await.unwrap());
    assert_eq!((report.from, report.to), (105, 160));

    let deposits: Vec<_> = store
        .transactions()
        .into_iter()
        .filter(|t| t.block_number == 150)
        .collect();
    assert_eq!(deposits.len(), 1);
    assert_eq!(
        store.pool(&pool_key()).await.unwrap().unwrap().total_deposited,
        "1200"
    );
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().last_block, 160);
}

#[tokio::test]
async fn test_member_whitelisted_then_promoted_to_guardian() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();
    let bob = address_to_string(addr(BOB));

    chain.set_member(
        addr(POOL),
        addr(BOB),
        MemberInfo {
            is_active: true,
            is_guardian: false,
            joined_at: U256::from(1_700_050_000u64),
        },
        U256::zero(),
    );
    chain.push_log(member_whitelisted_log(addr(POOL), addr(BOB), 110, 0));
    chain.set_head(110);
    indexer.run_once().await.unwrap();

    let member = store.member(&pool_key(), &bob).await.unwrap().unwrap();
    assert!(member.is_active);
    assert!(!member.is_guardian);
    assert_eq!(member.shares, "0");
    assert_eq!(member.joined_at.map(|t| t.timestamp()), Some(1_700_050_000));

    chain.set_member(
        addr(POOL),
        addr(BOB),
        MemberInfo {
            is_active: true,
            is_guardian: true,
            joined_at: U256::from(1_700_050_000u64),
        },
        U256::zero(),
    );
    chain.push_log(guardian_added_log(addr(POOL), addr(BOB), 111, 3));
    chain.set_head(111);
    indexer.run_once().await.unwrap();

    let member = store.member(&pool_key(), &bob).await.unwrap().unwrap();
    assert!(member.is_guardian);
    // membership events are not financial: no audit rows
    assert_eq!(store.transactions().len(), 1);
    assert_eq!(store.counts().await.unwrap().members, 2);
}

#[tokio::test]
async fn test_request_approved_moves_voting_to_approved() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();
    assert_eq!(
        store.request(&pool_key(), 0).await.unwrap().unwrap().status,
        RequestStatus::Voting
    );

    let mut request = funding_request(0, addr(ALICE), usdc(500), 2);
    request.yes_votes = ether(80);
    chain.set_request(addr(POOL), request);
    chain.push_log(request_decision_log(addr(POOL), EventKind::RequestApproved, 0, 112, 0));
    chain.set_head(112);
    indexer.run_once().await.unwrap();

    let row = store.request(&pool_key(), 0).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Approved);
    assert_eq!(row.yes_votes, ether(80).to_string());
}

#[tokio::test]
async fn test_request_rejected_moves_voting_to_rejected() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();

    chain.set_request(addr(POOL), funding_request(0, addr(ALICE), usdc(500), 3));
    chain.push_log(request_decision_log(addr(POOL), EventKind::RequestRejected, 0, 112, 0));
    chain.set_head(112);
    indexer.run_once().await.unwrap();

    let row = store.request(&pool_key(), 0).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Rejected);
    assert_eq!(store.counts().await.unwrap().requests, 1);
}

#[tokio::test]
async fn test_guardian_approval_refreshes_request() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();

    let mut request = funding_request(0, addr(ALICE), usdc(500), 2);
    request.yes_votes = ether(60);
    chain.set_request(addr(POOL), request);
    chain.push_log(guardian_approval_log(addr(POOL), 0, addr(BOB), 115, 1));
    chain.set_head(115);
    indexer.run_once().await.unwrap();

    let row = store.request(&pool_key(), 0).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Approved);
    assert_eq!(row.yes_votes, ether(60).to_string());
    assert!(store.votes_for(&pool_key(), 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chain_read_failure_during_reconciliation_keeps_checkpoint() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    indexer.run_once().await.unwrap();

    chain.set_request(addr(POOL), funding_request(0, addr(ALICE), usdc(500), 2));
    chain.push_log(request_decision_log(addr(POOL), EventKind::RequestApproved, 0, 120, 0));
    chain.set_head(120);
    chain.fail("getRequest");

    let err = indexer.run_once().await.unwrap_err();
    assert!(matches!(err, IndexerError::Rpc { method: "getRequest", .. }));
    assert_eq!(indexer.state(), IndexerState::FailedTick);
    assert!(indexer.last_block() < 120);
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().last_block, 104);
    assert_eq!(
        store.request(&pool_key(), 0).await.unwrap().unwrap().status,
        RequestStatus::Voting
    );

    chain.heal("getRequest");
    let report = advanced(indexer.run_once().await.unwrap());
    assert_eq!((report.from, report.to), (105, 120));
    assert_eq!(
        store.request(&pool_key(), 0).await.unwrap().unwrap().status,
        RequestStatus::Approved
    );
}

#[tokio::test]
async fn test_logs_from_untracked_emitters_are_ignored() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    let stranger = addr(0xdead);
    chain.push_log(deposited_log(stranger, addr(BOB), usdc(1), ether(1), 102, 0));

    indexer.run_once().await.unwrap();

    assert!(store.pool(&address_to_string(stranger)).await.unwrap().is_none());
    assert!(!indexer.registry().contains(&stranger));
    let pools = store.pools();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].address, pool_key());
}

#[tokio::test]
async fn test_refresh_pools_counts_successes() {
    let (chain, _store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    let broken: Address = addr(0xbad);
    chain.with(|s| s.factory_pools = vec![addr(POOL), broken]);

    indexer.run_once().await.unwrap();
    let refresh = indexer.refresh_pools().await.unwrap();
    assert_eq!(refresh.pools_found, 2);
    assert_eq!(refresh.pools_indexed, 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let (chain, store, mut indexer) = setup(100, 104);
    script_pool_lifecycle(&chain);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        indexer.run(rx).await;
        indexer
    });
    // poll until the first tick committed
    for _ in 0..100 {
        if store.load_checkpoint().await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    let indexer = handle.await.unwrap();
    assert_eq!(indexer.last_block(), 104);
    assert_eq!(indexer.state(), IndexerState::Idle);
}
