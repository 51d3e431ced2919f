//! the active operation table and the worker loop that drives every transfer
//! through libcurl's wait/perform cycle.
//!
//! this is the only code in the crate that ever touches the multi handle;
//! everything else reaches it indirectly through the submission queue.

use std::os::raw::c_long;
use std::time::{Duration, Instant};

use curl::multi::{Easy2Handle, Multi, WaitFd};
use slab::Slab;

use crate::{
    context::RequestContext,
    error::Error,
    queue::{NewSubmission, RequestHandle, Shared, Submission},
    wakeup::WakeupReader,
};

/// one row of the active operation table: a transfer libcurl is currently
/// driving, plus the identity its owner uses to cancel or unpause it.
struct Entry {
    easy: curl::multi::Easy2Handle<RequestContext>,
    handle: RequestHandle,
}

/// run until idle for `idle_timeout` with nothing queued, then return the
/// multi handle so the caller can cache it for the next burst.
pub(crate) fn run(
    shared: std::sync::Arc<Shared>,
    multi: Multi,
    mut wakeup: WakeupReader,
    idle_timeout: Duration,
) -> Multi {
    let mut table: Slab<Entry> = Slab::new();
    let mut idle_since: Option<Instant> = None;

    loop {
        for submission in shared.drain() {
            match submission {
                Submission::New(new) => begin_request(&multi, &mut table, new),
                Submission::Cancel(handle) => cancel(&multi, &mut table, &handle),
                Submission::Unpause(handle) => unpause(&mut table, &handle),
            }
        }

        if let Err(e) = multi.perform() {
            tracing::error!("curl_multi_perform failed, failing every in-flight transfer: {e}");
            fail_all(&multi, &mut table, Error::Multi(e));
            break;
        }

        reap_completions(&multi, &mut table);

        if table.is_empty() {
            if shared.is_empty() {
                match idle_since {
                    Some(since) if since.elapsed() >= idle_timeout => break,
                    Some(_) => {}
                    None => idle_since = Some(Instant::now()),
                }
            } else {
                idle_since = None;
            }
        } else {
            idle_since = None;
        }

        let mut waitfds = [WaitFd::new()];
        waitfds[0].set_fd(wakeup.socket());
        waitfds[0].poll_on_read(true);

        let wait_for = if table.is_empty() {
            idle_timeout.min(Duration::from_millis(250))
        } else {
            Duration::from_millis(250)
        };
        if let Err(e) = multi.wait(&mut waitfds, wait_for) {
            tracing::error!("curl_multi_wait failed, failing every in-flight transfer: {e}");
            fail_all(&multi, &mut table, Error::Multi(e));
            break;
        }
        wakeup.drain();
    }

    // every in-flight transfer must have been reaped or cancelled before we
    // get here, since the idle check above only fires when `table.is_empty()`.
    debug_assert!(table.is_empty());
    multi
}

fn begin_request(multi: &Multi, table: &mut Slab<Entry>, submission: NewSubmission) {
    let NewSubmission {
        context,
        configure,
    } = submission;

    let handle = context.handle().clone();
    let mut easy2 = curl::easy::Easy2::new(context);

    if let Err(e) = configure(&mut easy2) {
        easy2.get_mut().fail(e);
        return;
    }

    let easy2 = match multi.add2(easy2) {
        Ok(easy2) => easy2,
        Err(e) => {
            tracing::warn!("failed to register transfer with multi handle: {e}");
            return;
        }
    };

    let key = table.insert(Entry { easy: easy2, handle });
    if let Err(e) = table[key].easy.set_token(key) {
        tracing::warn!("failed to tag transfer with its token: {e}");
    }
}

fn cancel(multi: &Multi, table: &mut Slab<Entry>, handle: &RequestHandle) {
    let Some(key) = table.iter().find(|(_, e)| e.handle.is(handle)).map(|(k, _)| k) else {
        // already completed (and reaped) or never actually started; nothing to do.
        return;
    };

    let entry = table.remove(key);
    match multi.remove2(entry.easy) {
        Ok(mut easy2) => easy2.get_mut().fail(Error::Cancelled),
        Err(e) => tracing::warn!("failed to remove cancelled transfer: {e}"),
    }
}

fn unpause(table: &mut Slab<Entry>, handle: &RequestHandle) {
    let Some((_, entry)) = table.iter_mut().find(|(_, e)| e.handle.is(handle)) else {
        // the transfer finished (or was cancelled) between the pause and this
        // resumption request; nothing left to unpause.
        return;
    };

    if let Err(e) = entry.easy.unpause_read() {
        tracing::debug!("unpause_read failed: {e}");
    }
    if let Err(e) = entry.easy.unpause_write() {
        tracing::debug!("unpause_write failed: {e}");
    }
}

fn reap_completions(multi: &Multi, table: &mut Slab<Entry>) {
    let mut finished = Vec::new();
    multi.messages(|message| {
        if let Ok(token) = message.token() {
            if let Some(entry) = table.get(token) {
                if let Some(result) = message.result_for2(&entry.easy) {
                    finished.push((token, result));
                }
            }
        }
    });

    for (token, result) in finished {
        if !table.contains(token) {
            continue;
        }
        let entry = table.remove(token);
        match multi.remove2(entry.easy) {
            Ok(mut easy2) => finish_completed_transfer(&mut easy2, result),
            Err(e) => tracing::warn!("failed to remove completed transfer: {e}"),
        }
    }
}

/// handle one transfer's completion message: credential-transfer hook, then
/// either swallow an unsupported-protocol error on a followed redirect or
/// fail the caller's future.
fn finish_completed_transfer(easy2: &mut Easy2Handle<RequestContext>, result: Result<(), curl::Error>) {
    if !matches!(easy2.get_ref().status().map(|s| s.as_u16()), Some(401) | Some(407)) {
        let mask = http_auth_avail(easy2);
        if mask != 0 {
            easy2.get_mut().notify_auth_available(mask);
        }
    }

    if let Err(e) = result {
        if e.is_unsupported_protocol() && easy2.get_ref().is_redirect() {
            tracing::debug!("swallowing unsupported-protocol error on a followed redirect");
            return;
        }
        easy2.get_mut().fail(e.into());
    }
}

/// `CURLINFO_HTTPAUTH_AVAIL`, read directly off the raw handle: the safe
/// `curl` crate has no wrapper for it.
fn http_auth_avail(easy2: &Easy2Handle<RequestContext>) -> u32 {
    let mut mask: c_long = 0;
    let rc = unsafe {
        curl_sys::curl_easy_getinfo(easy2.raw(), curl_sys::CURLINFO_HTTPAUTH_AVAIL, &mut mask)
    };
    if rc != curl_sys::CURLE_OK {
        return 0;
    }
    mask as u32
}

/// fail every in-flight transfer with the same worker-loop-fatal error and
/// drain the table; called when `perform`/`wait` itself reports an error the
/// worker cannot recover from.
fn fail_all(multi: &Multi, table: &mut Slab<Entry>, err: Error) {
    for (_, entry) in table.drain() {
        match multi.remove2(entry.easy) {
            Ok(mut easy2) => easy2.get_mut().fail(err.clone()),
            Err(e) => tracing::warn!("failed to remove transfer during fatal shutdown: {e}"),
        }
    }
}
