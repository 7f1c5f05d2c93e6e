/// Number of leading bytes inspected when sniffing content.
pub const SNIFF_LEN: usize = 261;

/// Identifies content by its magic bytes. `None` means the type is unknown.
///
/// Only the first [`SNIFF_LEN`] bytes are considered, so the result is the same
/// whether the caller passes a prefix or the whole file.
pub fn classify(sample: &[u8]) -> Option<&'static str> {
    let sample = &sample[..sample.len().min(SNIFF_LEN)];
    infer::get(sample).map(|kind| kind.mime_type())
}
