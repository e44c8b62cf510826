//! App registration and the OAuth-shaped signup flows.
//!
//! One app registration per (server, scopes, redirect) tuple, cached in the
//! store and shared by every user authenticating against that tuple.

use mpf_db::{
    account_for_upstream, app_registration, create_account, create_user, set_account_state,
    set_app_registration, user_state, Store,
};
use mpf_mastodon::MastodonClient;
use mpf_schemas::{AppRegState, Error, Result, UserInfo};
use sha2::{Digest, Sha256};
use tracing::info;

/// Scopes requested from upstream servers.
pub const SCOPES: &str = "read write:favourites";

/// Out-of-band redirect: the user copies the auth code manually.
pub const REDIRECT_OOB: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Cache key for an app registration.
pub fn app_reg_key(server_addr: &str, scopes: &str, redirect_uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_addr.as_bytes());
    hasher.update(b"|");
    hasher.update(scopes.as_bytes());
    hasher.update(b"|");
    hasher.update(redirect_uri.as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_server_addr(server_addr: &str) -> Result<()> {
    if server_addr.starts_with("http://") || server_addr.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "server address '{server_addr}' must start with http:// or https://"
        )))
    }
}

fn query_escape(s: &str) -> String {
    // Only the characters that actually occur in our scope/redirect strings
    // need escaping.
    s.replace(' ', "%20").replace(':', "%3A").replace('/', "%2F")
}

/// Get-or-create the app registration for a server. A cache hit makes no
/// network call.
pub async fn register_app(
    store: &Store,
    client: &dyn MastodonClient,
    server_addr: &str,
) -> Result<AppRegState> {
    let key = app_reg_key(server_addr, SCOPES, REDIRECT_OOB);

    {
        let mut conn = store.read().await?;
        if let Some(reg) = app_registration(conn.as_mut(), &key).await? {
            return Ok(reg);
        }
    }

    let registered = client.register_app(server_addr, SCOPES, REDIRECT_OOB).await?;
    let reg = AppRegState {
        key: key.clone(),
        server_addr: server_addr.to_string(),
        scopes: SCOPES.to_string(),
        redirect_uri: REDIRECT_OOB.to_string(),
        client_id: registered.client_id.clone(),
        client_secret: registered.client_secret,
        auth_uri: format!(
            "{}/oauth/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}",
            server_addr.trim_end_matches('/'),
            query_escape(&registered.client_id),
            query_escape(REDIRECT_OOB),
            query_escape(SCOPES),
        ),
    };

    let mut txn = store.begin().await?;
    set_app_registration(txn.conn(), &reg).await?;
    txn.commit().await?;
    info!(server = server_addr, "registered app upstream");
    Ok(reg)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeOutcome {
    /// Upstream authorization URL the frontend sends the user to.
    pub authorize_addr: String,
    /// True when the redirect is out-of-band (manual code copy).
    pub out_of_band: bool,
}

/// Validate the request and return the upstream authorization URL, ensuring
/// a registration exists for the server.
pub async fn authorize(
    store: &Store,
    client: &dyn MastodonClient,
    server_addr: &str,
    invite_code: Option<&str>,
    required_invite_code: Option<&str>,
) -> Result<AuthorizeOutcome> {
    validate_server_addr(server_addr)?;
    check_invite(invite_code, required_invite_code)?;

    let reg = register_app(store, client, server_addr).await?;
    Ok(AuthorizeOutcome {
        authorize_addr: reg.auth_uri,
        out_of_band: reg.redirect_uri == REDIRECT_OOB,
    })
}

fn check_invite(given: Option<&str>, required: Option<&str>) -> Result<()> {
    match required {
        None => Ok(()),
        Some(required) => match given {
            Some(given) if given == required => Ok(()),
            _ => Err(Error::PermissionDenied("invite code required".to_string())),
        },
    }
}

/// Exchange an auth code for an access token, resolve the upstream account,
/// and create or attach the local user.
pub async fn token(
    store: &Store,
    client: &dyn MastodonClient,
    server_addr: &str,
    auth_code: &str,
) -> Result<UserInfo> {
    validate_server_addr(server_addr)?;
    if auth_code.is_empty() {
        return Err(Error::InvalidArgument("empty auth code".to_string()));
    }

    let reg = register_app(store, client, server_addr).await?;
    let access_token = client
        .obtain_token(
            server_addr,
            &reg.client_id,
            &reg.client_secret,
            &reg.redirect_uri,
            auth_code,
        )
        .await?;
    let upstream = client.verify_credentials(server_addr, &access_token).await?;

    let mut txn = store.begin().await?;
    let user = match account_for_upstream(txn.conn(), server_addr, &upstream.id).await? {
        Some(mut account) => {
            account.access_token = access_token;
            account.username = upstream.username.clone();
            set_account_state(txn.conn(), &account).await?;
            user_state(txn.conn(), account.uid).await?
        }
        None => {
            let user = create_user(txn.conn()).await?;
            create_account(
                txn.conn(),
                user.uid,
                server_addr,
                &upstream.id,
                &upstream.username,
                &access_token,
            )
            .await?;
            info!(uid = user.uid, username = %upstream.username, "created user");
            user
        }
    };
    txn.commit().await?;

    Ok(UserInfo::for_user(user))
}
