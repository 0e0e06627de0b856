use std::{io, sync::Once, thread};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use block_journal_rs::types::data_types::TlfId;
use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();

// Set up a logger that logs all log messages with level `level` and above.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

// Log a message from the test itself, tagged with the TLF it concerns, if any.
pub(crate) fn log_with_context(tlf: Option<TlfId>, msg: &str) {
    match tlf {
        Some(tlf) => log::debug!("{}, {}", first_seven_base64_chars(&tlf.bytes()), msg),
        None => log::debug!("{}", msg),
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}
