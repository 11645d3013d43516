use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::oneshot;

/// What should we do when the user stops
/// this program?
///
/// The first SIGINT or SIGTERM resolves the returned receiver so the server
/// can drain requests and cancel deployments. A second one exits at once.
pub fn handle_shutdown() -> std::io::Result<oneshot::Receiver<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = oneshot::channel();

    std::thread::spawn(move || {
        let mut tx = Some(tx);
        for signal in signals.forever() {
            match tx.take() {
                Some(tx) => {
                    log::info!("Received signal {signal}, shutting down");
                    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
                    let _ = tx.send(());
                }
                None => {
                    log::warn!("Received signal {signal} again, exiting now");
                    std::process::exit(1);
                }
            }
        }
    });

    Ok(rx)
}
