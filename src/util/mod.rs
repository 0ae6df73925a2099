mod text;

pub use text::{cap_words, host_of, strip_control_chars, strip_html, token_overlap, tokenize, truncate_chars};
