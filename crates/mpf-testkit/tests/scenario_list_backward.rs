use anyhow::Result;
use mpf_db::Store;
use mpf_testkit::{FakeMastodon, FAKE_ACCOUNT_ID, FAKE_SERVER, FAKE_USERNAME};

async fn setup_with_three_positioned() -> Result<(Store, i64)> {
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

    let fake = FakeMastodon::new();
    fake.post_status("one", &[]);
    fake.post_status("two", &[]);
    fake.post_status("three", &[]);
    mpf_ingest::ingest_home(&store, &fake, user.default_stid, 10).await?;

    let mut txn = store.begin().await?;
    mpf_stream::list_forward(txn.conn(), user.default_stid, 0, true, 10).await?;
    txn.commit().await?;
    Ok((store, user.default_stid))
}

#[tokio::test]
async fn backward_window_returns_ascending_positions() -> Result<()> {
    let (store, stid) = setup_with_three_positioned().await?;

    let mut conn = store.read().await?;
    let (items, _) = mpf_stream::list_backward(conn.as_mut(), stid, 3, 10).await?;
    assert_eq!(
        items.iter().map(|i| i.position).collect::<Vec<_>>(),
        vec![1, 2],
        "items before position 3, in ascending order"
    );

    let (items, _) = mpf_stream::list_backward(conn.as_mut(), stid, 1, 10).await?;
    assert!(items.is_empty(), "nothing exists before the first position");
    Ok(())
}

#[tokio::test]
async fn backward_leaves_the_pool_untouched() -> Result<()> {
    let (store, stid) = setup_with_three_positioned().await?;

    // Refill the pool with one more status.
    let fake = FakeMastodon::new();
    fake.post_status("one", &[]);
    fake.post_status("two", &[]);
    fake.post_status("three", &[]);
    fake.post_status("four", &[]);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    let before = {
        let mut conn = store.read().await?;
        mpf_db::stream_state(conn.as_mut(), stid).await?
    };
    assert!(before.remaining > 0);

    let mut conn = store.read().await?;
    mpf_stream::list_backward(conn.as_mut(), stid, 3, 10).await?;
    drop(conn);

    let after = {
        let mut conn = store.read().await?;
        mpf_db::stream_state(conn.as_mut(), stid).await?
    };
    assert_eq!(before, after, "backward listing must never triage");
    Ok(())
}
