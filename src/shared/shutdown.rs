use tokio::signal;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Waits until the process should shut down. This happens in 3 cases
///     1. SIGINT or SIGTERM was delivered
///     2. user is explicitly asking us to shut down through the oneshot channel
///     3. the cancellation token was cancelled from elsewhere
/// The token is cancelled on return so every task watching it observes the shutdown.
pub(crate) async fn shutdown_signal(
    shutdown_from_user: Option<oneshot::Receiver<()>>,
    cln_token: CancellationToken,
) {
    // will call cancel_token.cancel() on drop of guard
    let _drop_guard = cln_token.clone().drop_guard();

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    let shutdown_from_user_future = async {
        match shutdown_from_user {
            Some(rx) => {
                rx.await.ok();
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown_from_user_future => {},
        _ = cln_token.cancelled() => {},
    }
}
