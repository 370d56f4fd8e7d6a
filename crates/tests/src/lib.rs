pub mod fixtures;

#[cfg(test)]
mod room_tests;
#[cfg(test)]
mod broadcaster_tests;
#[cfg(test)]
mod ws_tests;
