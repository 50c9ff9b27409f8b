use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::SystemTime;

use crate::config::ServerConfig;
use crate::dispatch::{Disposition, Resolution};
use crate::encoding::{HtmlEscaped, HttpDate, ListingDate, UrlEncoded};
use crate::error::RequestError;
use crate::resolve::ListInfo;

/// "Generated by" string.
struct GeneratedOn<'a>(&'a ServerConfig, SystemTime);

impl<'a> fmt::Display for GeneratedOn<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.server_id {
            writeln!(
                f,
                "Generated by {}/{} on {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                HttpDate(self.1)
            )?;
        }
        Ok(())
    }
}

/// Directory listing.
struct Listing<'a>(&'a [ListInfo]);

impl<'a> fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max_len = self
            .0
            .iter()
            .map(|entry| entry.name.chars().count())
            .max()
            .unwrap_or(2);

        writeln!(f, "<a href=\"..\">..</a>/")?;

        for entry in self.0 {
            let name = entry.name.trim_end_matches('/');
            write!(f, "<a href=\"{}", UrlEncoded(name))?;
            if entry.is_dir {
                write!(f, "/")?;
            }
            write!(f, "\">{}</a>", HtmlEscaped(&entry.name))?;
            let num_spaces = max_len - entry.name.chars().count();
            for _ in 0..num_spaces {
                write!(f, " ")?;
            }
            match entry.modified {
                Some(modified) => write!(f, "  {}", ListingDate(modified))?,
                None => write!(f, "  {:16}", "")?,
            }
            if entry.is_dir {
                writeln!(f, "  {:>10}", "-")?;
            } else {
                writeln!(f, "  {:10}", entry.size)?;
            }
        }
        Ok(())
    }
}

/// Status line and headers shared by every response.
fn common_headers(config: &ServerConfig, code: u16, name: &str, now: SystemTime) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
        Date: {}\r\n\
        {}\
        Connection: close\r\n",
        code,
        name,
        HttpDate(now),
        config.server_header(),
    )
}

/// Head and body of a generated HTML reply.
fn generated(headers: String, body: String, head_only: bool) -> Vec<u8> {
    let mut reply = format!(
        "{}\
        Content-Length: {}\r\n\
        Content-Type: text/html; charset=UTF-8\r\n\
        \r\n",
        headers,
        body.as_bytes().len()
    )
    .into_bytes();
    if !head_only {
        reply.extend_from_slice(body.as_bytes());
    }
    reply
}

/// A default reply for any (erroneous) occasion.
pub fn default_reply(
    config: &ServerConfig,
    error: RequestError,
    now: SystemTime,
    head_only: bool,
) -> Vec<u8> {
    let errcode = error.status();
    let errname = error.status_name();
    let body = format!(
        "<html><head><title>{} {}</title></head><body>\n\
        <h1>{}</h1>\n\
        {}\n\
        <hr>\n\
        {}\
        </body></html>\n",
        errcode,
        errname,
        errname,
        error,
        GeneratedOn(config, now),
    );
    let mut headers = common_headers(config, errcode, errname, now);
    if error.challenge() {
        headers.push_str("WWW-Authenticate: Basic realm=\"User Visible Realm\"\r\n");
    }
    generated(headers, body, head_only)
}

/// A redirect reply.
fn redirect(config: &ServerConfig, location: &str, now: SystemTime, head_only: bool) -> Vec<u8> {
    let body = format!(
        "<html><head><title>301 Moved Permanently</title></head><body>\n\
        <h1>Moved Permanently</h1>\n\
        Moved to: <a href=\"{}\">{}</a>\n\
        <hr>\n\
        {}\
        </body></html>\n",
        HtmlEscaped(location),
        HtmlEscaped(location),
        GeneratedOn(config, now),
    );
    let mut headers = common_headers(config, 301, "Moved Permanently", now);
    headers.push_str(&format!("Location: {}\r\n", location));
    generated(headers, body, head_only)
}

/// A directory listing reply.
fn dir_listing(
    config: &ServerConfig,
    url: &str,
    entries: &[ListInfo],
    now: SystemTime,
    head_only: bool,
) -> Vec<u8> {
    let body = format!(
        "<html>\n<head>\n<title>{}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>{}</h1>\n<tt><pre>\n\
        {}\
        </pre></tt>\n\
        <hr>\n\
        {}\
        </body>\n</html>\n",
        HtmlEscaped(url),
        HtmlEscaped(url),
        Listing(entries),
        GeneratedOn(config, now),
    );
    generated(common_headers(config, 200, "OK", now), body, head_only)
}

/// Write the reply for `resolution` and return the number of bytes sent.
///
/// A file that can no longer be opened, or that has been replaced by a symlink, is answered
/// with the matching error page.
pub fn write_response<W: Write>(
    out: &mut W,
    config: &ServerConfig,
    resolution: &Resolution,
    head_only: bool,
) -> io::Result<u64> {
    let now = SystemTime::now();
    let reply = match &resolution.disposition {
        Disposition::Error(error) => default_reply(config, *error, now, head_only),
        Disposition::Redirect(location) => redirect(config, location, now, head_only),
        Disposition::Listing { url, entries } => {
            dir_listing(config, url, entries, now, head_only)
        }
        Disposition::File {
            path,
            modified,
            mimetype,
            ..
        } => return write_file(out, config, path, *modified, mimetype, now, head_only),
    };
    out.write_all(&reply)?;
    out.flush()?;
    Ok(reply.len() as u64)
}

fn write_file<W: Write>(
    out: &mut W,
    config: &ServerConfig,
    path: &Path,
    modified: Option<SystemTime>,
    mimetype: &str,
    now: SystemTime,
    head_only: bool,
) -> io::Result<u64> {
    // `path` is already the real path, so a symlink here was swapped in after resolution.
    let opened = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path);
    let (mut file, len) = match opened.and_then(|file| {
        let len = file.metadata()?.len();
        Ok((file, len))
    }) {
        Ok(opened) => opened,
        Err(e) => {
            let error = match e.kind() {
                io::ErrorKind::PermissionDenied => RequestError::Forbidden,
                _ => RequestError::NotFound,
            };
            let reply = default_reply(config, error, now, head_only);
            out.write_all(&reply)?;
            out.flush()?;
            return Ok(reply.len() as u64);
        }
    };

    let mut headers = common_headers(config, 200, "OK", now);
    headers.push_str(&format!(
        "Content-Length: {}\r\n\
        Content-Type: {}\r\n",
        len, mimetype
    ));
    if let Some(modified) = modified {
        headers.push_str(&format!("Last-Modified: {}\r\n", HttpDate(modified)));
    }
    headers.push_str("\r\n");
    out.write_all(headers.as_bytes())?;
    let mut sent = headers.len() as u64;
    if !head_only {
        sent += io::copy(&mut file, out)?;
    }
    out.flush()?;
    Ok(sent)
}
