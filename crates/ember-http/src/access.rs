//! Per-vhost access logging in Combined Log Format, with optional
//! include/exclude glob filters on the request filename. Prefork
//! workers hand their lines to the parent over PPC; everyone else
//! writes to the klog sink directly.

use chrono::Local;
use ember_core::klog::Level;
use ember_core::ppc::PpcMessage;

use crate::error::HttpError;
use crate::http::WorkerCtx;
use crate::request::Request;
use crate::response::Response;
use crate::vhost::Vhost;

const DEFAULT_PREFIX: &str = "[access]";

/// Minimal fnmatch: `*` any run, `?` any single byte.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

fn dash_if_empty(v: &str) -> &str {
    if v.is_empty() { "-" } else { v }
}

fn ip_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(addr)
}

/// Append one line for this request, honouring the vhost's `log` /
/// `dontlog` filters. A vhost with no log sink logs nothing.
pub fn access_log(
    vhost: &Vhost,
    ctx: &WorkerCtx,
    rq: &Request,
    rs: &Response,
) -> Result<(), HttpError> {
    let Some(klog) = &vhost.klog else { return Ok(()) };

    let fname = rq.filename().unwrap_or("");
    let (mut wanted, mut has_filter) = (false, false);
    let mut prefix = DEFAULT_PREFIX;

    if let Some(al) = &vhost.al_config {
        for n in 0.. {
            let Some(sub) = al.child_n(Some("log"), n) else { break };
            has_filter = true;
            if sub.value().is_some_and(|pat| glob_match(pat, fname)) {
                wanted = true;
                break;
            }
        }
        for n in 0.. {
            let Some(sub) = al.child_n(Some("dontlog"), n) else { break };
            if sub.value().is_some_and(|pat| glob_match(pat, fname)) {
                return Ok(());
            }
        }
        if let Some(p) = al.subkey_value("prefix") {
            prefix = p;
        }
    }
    if has_filter && !wanted {
        return Ok(());
    }

    let stamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
    let line = format!(
        "{prefix} {} - - [{stamp}] \"{}\" {} {} \"{}\" \"{}\" \"-\"",
        dash_if_empty(ip_of(rq.peer_addr())),
        dash_if_empty(rq.client_request()),
        rs.status(),
        dash_if_empty(&rs.field_value("Content-Length").unwrap_or_default()),
        dash_if_empty(rq.field_value("Referer").unwrap_or("")),
        dash_if_empty(rq.field_value("User-Agent").unwrap_or("")),
    );

    match &ctx.link {
        Some(link) if ctx.prefork => {
            link.borrow_mut()
                .send(&PpcMessage::AccessLog {
                    bid: ctx.backend_id,
                    vhost: vhost.id,
                    line,
                })
                .map_err(|e| HttpError::Other(e.to_string()))?;
        }
        _ => {
            klog.borrow_mut()
                .log(Level::Info, &line)
                .map_err(|e| HttpError::Other(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "/anything"));
        assert!(glob_match("/img/*.png", "/img/a.png"));
        assert!(!glob_match("/img/*.png", "/css/a.png"));
        assert!(glob_match("/file?.txt", "/file1.txt"));
        assert!(!glob_match("/file?.txt", "/file12.txt"));
        assert!(glob_match("*.html", "/deep/dir/page.html"));
    }
}
