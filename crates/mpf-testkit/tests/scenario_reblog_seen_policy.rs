use anyhow::Result;
use mpf_db::Store;
use mpf_schemas::{AlreadySeen, SeenReblogs, SettingSeenReblogs};
use mpf_testkit::{FakeMastodon, FAKE_ACCOUNT_ID, FAKE_SERVER, FAKE_USERNAME};

async fn setup(policy: Option<SeenReblogs>) -> Result<(Store, i64, i64)> {
    let store = Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;
    let mut txn = store.begin().await?;
    let mut user = mpf_db::create_user(txn.conn()).await?;
    if let Some(value) = policy {
        user.settings.seen_reblogs = SettingSeenReblogs {
            value,
            overridden: true,
        };
        mpf_db::set_user_state(txn.conn(), &user).await?;
    }
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
    Ok((store, user.uid, user.default_stid))
}

async fn already_seen_of(store: &Store, stid: i64, status_id: &str) -> Result<AlreadySeen> {
    let mut conn = store.read().await?;
    let state: String = sqlx::query_scalar(
        "SELECT stream_status_state FROM streamcontent WHERE stid = ? AND status_id = ?",
    )
    .bind(stid)
    .bind(status_id)
    .fetch_one(conn.as_mut())
    .await?;
    let parsed: mpf_schemas::StreamStatusState = serde_json::from_str(&state)?;
    Ok(parsed.already_seen)
}

#[tokio::test]
async fn hide_policy_marks_seen_reblogs() -> Result<()> {
    // Default policy is HIDE.
    let (store, _uid, stid) = setup(None).await?;
    let fake = FakeMastodon::new();
    let original = fake.post_status("the original toot", &[]);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    let boost = fake.post_reblog(&original);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    assert_eq!(already_seen_of(&store, stid, &boost).await?, AlreadySeen::Yes);
    Ok(())
}

#[tokio::test]
async fn show_policy_keeps_seen_reblogs_visible() -> Result<()> {
    let (store, _uid, stid) = setup(Some(SeenReblogs::Show)).await?;
    let fake = FakeMastodon::new();
    let original = fake.post_status("the original toot", &[]);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    let boost = fake.post_reblog(&original);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    assert_eq!(already_seen_of(&store, stid, &boost).await?, AlreadySeen::No);
    Ok(())
}

#[tokio::test]
async fn reblog_of_an_unseen_original_is_not_marked() -> Result<()> {
    let (store, uid, stid) = setup(None).await?;
    let fake = FakeMastodon::new();
    // Move the cursor past the original so it never reaches this stream.
    let hidden = fake.post_status("posted before signup", &[]);
    let mut txn = store.begin().await?;
    let mut account = mpf_db::first_account_for_user(txn.conn(), uid).await?;
    account.last_home_status_id = Some(hidden.clone());
    mpf_db::set_account_state(txn.conn(), &account).await?;
    txn.commit().await?;

    let boost = fake.post_reblog(&hidden);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    assert_eq!(already_seen_of(&store, stid, &boost).await?, AlreadySeen::No);
    Ok(())
}

#[tokio::test]
async fn second_reblog_of_the_same_original_counts_as_seen() -> Result<()> {
    let (store, uid, stid) = setup(None).await?;
    let fake = FakeMastodon::new();
    // The first boost arrives without its original ever being on the stream.
    let hidden = fake.post_status("posted before signup", &[]);
    let mut txn = store.begin().await?;
    let mut account = mpf_db::first_account_for_user(txn.conn(), uid).await?;
    account.last_home_status_id = Some(hidden.clone());
    mpf_db::set_account_state(txn.conn(), &account).await?;
    txn.commit().await?;

    let first_boost = fake.post_reblog(&hidden);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(
        already_seen_of(&store, stid, &first_boost).await?,
        AlreadySeen::No
    );

    // A second boost of the same original matches the first boost's
    // projected reblog id.
    let second_boost = fake.post_reblog(&hidden);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(
        already_seen_of(&store, stid, &second_boost).await?,
        AlreadySeen::Yes
    );
    Ok(())
}
