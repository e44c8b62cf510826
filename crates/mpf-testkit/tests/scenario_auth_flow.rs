use anyhow::Result;
use mpf_schemas::Error;
use mpf_testkit::{FakeMastodon, FAKE_SERVER, FAKE_USERNAME};

#[tokio::test]
async fn token_exchange_creates_user_account_and_stream_once() -> Result<()> {
    let store = mpf_db::Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;
    let fake = FakeMastodon::new();

    let info = mpf_auth::token(&store, &fake, FAKE_SERVER, "auth-code").await?;
    assert_eq!(info.user.uid, 1);
    assert!(info.default_stid > 0);
    assert_eq!(info.defaults.list_count, mpf_schemas::DEFAULT_LIST_COUNT);

    {
        let mut conn = store.read().await?;
        let account = mpf_db::first_account_for_user(conn.as_mut(), info.user.uid).await?;
        assert_eq!(account.server_addr, FAKE_SERVER);
        assert_eq!(account.username, FAKE_USERNAME);
        assert_eq!(account.access_token, "fake-token-1");
        let stream = mpf_db::stream_state(conn.as_mut(), info.default_stid).await?;
        assert_eq!(stream.uid, info.user.uid);
    }

    // A second exchange for the same upstream account attaches instead of
    // creating a new user, and rotates the stored token.
    let info2 = mpf_auth::token(&store, &fake, FAKE_SERVER, "auth-code-2").await?;
    assert_eq!(info2.user.uid, info.user.uid);
    let mut conn = store.read().await?;
    assert_eq!(mpf_db::list_users(conn.as_mut()).await?.len(), 1);
    let account = mpf_db::first_account_for_user(conn.as_mut(), info.user.uid).await?;
    assert_eq!(account.access_token, "fake-token-2");
    Ok(())
}

#[tokio::test]
async fn app_registration_is_cached_across_calls() -> Result<()> {
    let store = mpf_db::Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;
    let fake = FakeMastodon::new();

    let first = mpf_auth::authorize(&store, &fake, FAKE_SERVER, None, None).await?;
    assert!(first.out_of_band);
    assert!(first.authorize_addr.starts_with(FAKE_SERVER));
    assert!(first.authorize_addr.contains("client_id=fake-client-id"));

    let second = mpf_auth::authorize(&store, &fake, FAKE_SERVER, None, None).await?;
    assert_eq!(first, second);
    assert_eq!(
        fake.register_calls(),
        1,
        "cache hit must not re-register upstream"
    );
    Ok(())
}

#[tokio::test]
async fn invite_code_gates_authorize_when_required() -> Result<()> {
    let store = mpf_db::Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;
    let fake = FakeMastodon::new();

    let err = mpf_auth::authorize(&store, &fake, FAKE_SERVER, None, Some("sesame"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    let err = mpf_auth::authorize(&store, &fake, FAKE_SERVER, Some("wrong"), Some("sesame"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    mpf_auth::authorize(&store, &fake, FAKE_SERVER, Some("sesame"), Some("sesame")).await?;
    Ok(())
}

#[tokio::test]
async fn malformed_server_addr_is_rejected_before_any_network_call() -> Result<()> {
    let store = mpf_db::Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;
    let fake = FakeMastodon::new();

    let err = mpf_auth::authorize(&store, &fake, "mast.example", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(fake.register_calls(), 0);
    Ok(())
}
