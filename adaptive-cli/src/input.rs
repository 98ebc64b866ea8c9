use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Listens for 'q' on a dedicated thread and cancels `token` when pressed.
///
/// The terminal is put in raw mode for the lifetime of the thread; the
/// thread exits as soon as the token is cancelled from either side.
pub fn spawn_input_handler(token: CancellationToken) -> JoinHandle<()> {
    thread::spawn(move || {
        if terminal::enable_raw_mode().is_err() {
            info!("Failed to enable raw mode. Input handling will be disabled.");
            return;
        }

        while !token.is_cancelled() {
            if let Ok(true) = event::poll(Duration::from_millis(100))
                && let Ok(Event::Key(KeyEvent {
                    code: KeyCode::Char('q'),
                    modifiers: KeyModifiers::NONE,
                    ..
                })) = event::read()
            {
                info!("Cancellation requested. Shutting down gracefully...");
                token.cancel();
            }
        }

        if terminal::disable_raw_mode().is_err() {
            info!("Failed to disable raw mode.");
        }
    })
}
