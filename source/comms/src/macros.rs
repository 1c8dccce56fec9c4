#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! rev_log {
    (trace,   $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug,   $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,    $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,    $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error,   $($arg:expr),*) => { defmt::error!($($arg),*) };
    (println, $($arg:expr),*) => { defmt::println!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! rev_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! rev_trace {
    ($($arg:expr),*) => (rev_log!(trace, $($arg),*));
}

macro_rules! rev_debug {
    ($($arg:expr),*) => (rev_log!(debug, $($arg),*));
}

macro_rules! rev_info {
    ($($arg:expr),*) => (rev_log!(info, $($arg),*));
}

macro_rules! rev_warn {
    ($($arg:expr),*) => (rev_log!(warn, $($arg),*));
}

macro_rules! rev_error {
    ($($arg:expr),*) => (rev_log!(error, $($arg),*));
}
