//! Name-based MIME type guessing.

use trawl_compress::Compression;

pub const OCTET_STREAM: &str = "application/octet-stream";
/// Type given to a Microsoft Graph mail account, so that it can be turned
/// into a mailbox source.
pub const GRAPH_MAIL_ACCOUNT: &str = "application/vnd.os2.datascanner.graphmailaccount";
pub const GRAPH_FILES_DRIVE: &str = "application/vnd.os2.datascanner.graphdrive";
pub const GRAPH_CALENDAR_ACCOUNT: &str = "application/vnd.os2.datascanner.graphcalendaraccount";
pub const GRAPH_LIST: &str = "application/vnd.os2.datascanner.graphlist";

/// Guesses a MIME type from the final component of a path.
///
/// Compressed files get the type of their encoding, not of their content:
/// `doc.pdf.gz` is `application/gzip`, because that's what must be undone
/// first.
pub fn guess_from_name(path: &str) -> String {
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
    match Compression::from_name(name) {
        Some(compression) => compression.mime_type().to_string(),
        None => mime_guess::from_path(name).first_raw().unwrap_or(OCTET_STREAM).to_string(),
    }
}

/// Drops any parameters from a MIME type and lowercases it.
pub fn base_type(mime: &str) -> String {
    mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dir/report.pdf", "application/pdf")]
    #[case("report.pdf.gz", "application/gzip")]
    #[case("logs/app.log.bz2", "application/x-bzip2")]
    #[case("dump.xz", "application/x-xz")]
    #[case("backup.tar", "application/x-tar")]
    #[case("letter.eml", "message/rfc822")]
    #[case("notes.txt", "text/plain")]
    #[case("Makefile", OCTET_STREAM)]
    fn test_guess_from_name(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(guess_from_name(path), expected);
    }

    #[rstest]
    #[case("text/HTML; charset=utf-8", "text/html")]
    #[case("application/json", "application/json")]
    fn test_base_type(#[case] mime: &str, #[case] expected: &str) {
        assert_eq!(base_type(mime), expected);
    }
}
