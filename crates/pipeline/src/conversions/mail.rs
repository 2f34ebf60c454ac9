use super::{Converter, Converters, Representation};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use mailparse::MailHeaderMap;
use std::collections::BTreeMap;
use trawl_model::OutputType;

pub(super) fn register(converters: &mut Converters) {
    converters.register(OutputType::EmailHeaders, Some("message/rfc822"), Converter::Content(email_headers));
}

/// The headers of a mail, keyed by lowercase name. Repeated headers are
/// joined with `", "`.
fn email_headers(content: &[u8]) -> Result<Representation> {
    let (headers, _) =
        mailparse::parse_headers(content).or_raise(|| ErrorKind::Conversion(OutputType::EmailHeaders))?;
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for header in &headers {
        let key = header.get_key().to_ascii_lowercase();
        if map.contains_key(&key) {
            continue;
        }
        let values = headers.get_all_values(&key);
        map.insert(key, values.join(", "));
    }
    Ok(Representation::EmailHeaders(map))
}
