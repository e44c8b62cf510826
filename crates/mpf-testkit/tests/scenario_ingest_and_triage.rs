use anyhow::Result;
use mpf_db::Store;
use mpf_testkit::{FakeMastodon, FAKE_ACCOUNT_ID, FAKE_SERVER, FAKE_USERNAME};

async fn setup() -> Result<(Store, i64)> {
    let store = Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;
    let mut txn = store.begin().await?;
    let user = mpf_db::create_user(txn.conn()).await?;
    mpf_db::create_account(
        txn.conn(),
        user.uid,
        FAKE_SERVER,
        FAKE_ACCOUNT_ID,
        FAKE_USERNAME,
        "tok",
    )
    .await?;
    txn.commit().await?;
    Ok((store, user.default_stid))
}

#[tokio::test]
async fn ingest_fills_the_pool_and_triage_orders_by_creation_time() -> Result<()> {
    let (store, stid) = setup().await?;
    let fake = FakeMastodon::new();
    fake.post_status("first", &[]);
    fake.post_status("second", &[]);
    fake.post_status("third", &[]);

    // Everything lands in the pool, nothing is positioned yet.
    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(stats.fetched, 3);

    let mut conn = store.read().await?;
    let stream = mpf_db::stream_state(conn.as_mut(), stid).await?;
    assert_eq!(stream.remaining, 3);
    assert_eq!(stream.first_position, 0);
    assert_eq!(stream.last_position, 0);
    drop(conn);

    // Initial list with a window of two triages the two earliest statuses.
    let mut txn = store.begin().await?;
    let (items, stream) = mpf_stream::list_forward(txn.conn(), stid, 0, true, 2).await?;
    txn.commit().await?;
    assert_eq!(items.len(), 2);
    assert_eq!((items[0].position, items[0].status.id.as_str()), (1, "10"));
    assert_eq!((items[1].position, items[1].status.id.as_str()), (2, "11"));
    assert_eq!(stream.remaining, 1);
    assert_eq!(stream.first_position, 1);
    assert_eq!(stream.last_position, 2);

    // Continuing forward drains the last pool item.
    let mut txn = store.begin().await?;
    let (items, stream) = mpf_stream::list_forward(txn.conn(), stid, 2, false, 2).await?;
    txn.commit().await?;
    assert_eq!(items.len(), 1);
    assert_eq!((items[0].position, items[0].status.id.as_str()), (3, "12"));
    assert_eq!(stream.remaining, 0);
    Ok(())
}

#[tokio::test]
async fn first_fetch_sees_only_the_newest_page() -> Result<()> {
    // Without a stored cursor the upstream serves its newest page; older
    // history is not backfilled.
    let (store, stid) = setup().await?;
    let fake = FakeMastodon::new();
    for i in 0..30 {
        fake.post_status(&format!("status {i}"), &[]);
    }

    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(stats.fetched, 20);

    let mut conn = store.read().await?;
    let stream = mpf_db::stream_state(conn.as_mut(), stid).await?;
    let account = mpf_db::first_account_for_user(conn.as_mut(), stream.uid).await?;
    assert_eq!(account.last_home_status_id.as_deref(), Some("39"));
    Ok(())
}

#[tokio::test]
async fn multi_page_backlog_is_drained_within_the_batch_budget() -> Result<()> {
    let (store, stid) = setup().await?;
    let fake = FakeMastodon::new();
    fake.post_status("seed", &[]);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    // A large backlog accumulates past the stored cursor.
    for i in 0..47 {
        fake.post_status(&format!("later {i}"), &[]);
    }

    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(stats.fetched, 47);
    assert!(!stats.hit_batch_cap);

    let mut conn = store.read().await?;
    let stream = mpf_db::stream_state(conn.as_mut(), stid).await?;
    assert_eq!(stream.remaining, 48);
    let account = mpf_db::first_account_for_user(conn.as_mut(), stream.uid).await?;
    assert_eq!(account.last_home_status_id.as_deref(), Some("57"));
    Ok(())
}

#[tokio::test]
async fn batch_cap_reports_more_remaining() -> Result<()> {
    let (store, stid) = setup().await?;
    let fake = FakeMastodon::new();
    fake.post_status("seed", &[]);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    for i in 0..47 {
        fake.post_status(&format!("later {i}"), &[]);
    }

    // One page of 20 per call: a single batch cannot drain the backlog.
    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 1).await?;
    assert_eq!(stats.fetched, 20);
    assert!(stats.hit_batch_cap);

    // The next pass continues from last_home_status_id.
    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(stats.fetched, 27);
    assert!(!stats.hit_batch_cap);
    Ok(())
}
