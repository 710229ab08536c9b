//! Write HTTP access log files in the Combined Log Format (extended
//! Common Log Format) for access logs (Apache style), as per
//! <https://httpd.apache.org/docs/2.4/logs.html>.

use std::io::{sink, stderr, BufWriter, Write};
use std::mem::swap;
use std::panic;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rouille::ResponseBody;

use crate::arequest::ARequest;
use crate::aresponse::AResponse;
use crate::easy_fs::open_log_output;
use crate::warn;

// "06/Dec/2023:02:02:47 +0000"
pub fn write_time(
    outp: &mut impl Write,
    time: SystemTime
) -> Result<()> {
    let dt: DateTime<Utc> = DateTime::from(time);
    write!(outp, "{}", dt.format("%d/%b/%Y:%H:%M:%S +0000"))?;
    Ok(())
}

// Apache:
// 18.134.151.89 - - [06/Dec/2023:02:02:47 +0100] "GET /login.jsp HTTP/1.1" 404 447 "-" "'Cloud mapping experiment. Contact research@pdrlabs.net'"
// We also add duration at the end.

/// Write to access.log
pub fn write_combined(
    outp: &mut impl Write,
    request: &ARequest,
    duration: Duration,
    aresponse: &mut AResponse, // temporarily swaps out ResponseBody and back
) -> Result<()> {
    // Write the time when the log entry is made, not when the
    // request started
    let now = SystemTime::now();
    write!(outp, "{} - - [", request.client_ip())?;
    write_time(outp, now)?;
    let len = {
        // The body length is private; take the body apart and put it
        // back together to get at it.
        let mut responsebody = ResponseBody::empty();
        swap(&mut responsebody, &mut aresponse.response.data);
        let (data, length) = responsebody.into_reader_and_size();
        responsebody =
            if let Some(len) = length {
                ResponseBody::from_reader_and_size(data, len)
            } else {
                ResponseBody::from_reader(data)
            };
        swap(&mut responsebody, &mut aresponse.response.data);
        length
    };
    writeln!(outp, "] {:?} {} {} {:?} {:?} {duration:?}",
             request.request_line(),
             aresponse.response.status_code,
             len.unwrap_or(0),
             request.referer().unwrap_or("-"),
             request.user_agent().unwrap_or("-")
    )?;
    outp.flush()?;
    Ok(())
}

/// Write to error.log
fn write_error(
    outp: &mut impl Write,
    request: &ARequest,
    duration: Duration,
    err: &anyhow::Error,
) -> Result<()> {
    let now = SystemTime::now();
    write!(outp, "[")?;
    write_time(outp, now)?;
    writeln!(outp, "] [error] [client {}] {:?} {duration:?}: {err:#}",
             request.client_ip(),
             request.request_line())?;
    outp.flush()?;
    Ok(())
}

/// Panic log to stderr.
fn write_panic_stderr(
    request: &ARequest,
    duration: Duration
) {
    let mut outp = BufWriter::new(stderr().lock());
    // stderr goes to a supervisor adding timestamps
    let _ = writeln!(&mut outp, "[panic] handling {:?} after {duration:?}",
                     request.request_line());
    let _ = outp.flush();
}


// rouille::log_custom can't be used: the log files depend on the site,
// which is only known inside the handler.

/// The log files of a site, or of requests matching no site. Should
/// do buffering (i.e. be BufWriter), the code calls flush once per
/// entry.
pub struct Logs {
    pub access_log: Box<dyn Write + Send + Sync>,
    pub error_log: Box<dyn Write + Send + Sync>,
}

impl Logs {
    /// `{name}_access.log` and `{name}_error.log` in `logbasedir`.
    pub fn open_in_basedir(
        logbasedir: &Path,
        name: &str,
    ) -> Result<Arc<Mutex<Logs>>>
    {
        Ok(Arc::new(Mutex::new(Logs {
            access_log: open_log_output(logbasedir.join(format!("{name}_access.log")))?,
            error_log: open_log_output(logbasedir.join(format!("{name}_error.log")))?,
        })))
    }

    /// Logs going nowhere.
    pub fn discard() -> Arc<Mutex<Logs>> {
        Arc::new(Mutex::new(Logs {
            access_log: Box::new(sink()),
            error_log: Box::new(sink()),
        }))
    }
}


/// Run `handler`, logging its outcome to the logs it returns. An
/// error is turned into a response by `on_error`.
pub fn log_combined<F, E>(
    request: &ARequest,
    handler: F,
    on_error: E,
) -> AResponse
where
    F: FnOnce() -> (Arc<Mutex<Logs>>, anyhow::Result<AResponse>),
    E: FnOnce(&anyhow::Error) -> AResponse,
{
    let start_instant = Instant::now();

    // Call the handler and catch panics; unwinding is resumed
    // below.
    let result = panic::catch_unwind(panic::AssertUnwindSafe(handler));
    let elapsed = start_instant.elapsed();

    match result {
        Ok((logs, result)) => {
            let mut response = match result {
                Ok(response) => response,
                Err(err) => {
                    {
                        let mut logs = logs.lock().expect(
                            "if `write` panics then we are lost anyway");
                        if let Err(e) = write_error(&mut logs.error_log, request, elapsed, &err) {
                            warn!("could not write to error log: {e:#}")
                        }
                    }
                    on_error(&err)
                }
            };
            let mut logs = logs.lock().expect(
                "if `write` panics then we are lost anyway");
            if let Err(e) = write_combined(&mut logs.access_log, request, elapsed, &mut response) {
                warn!("could not write to access log: {e:#}")
            }
            response
        }
        Err(payload) => {
            write_panic_stderr(request, elapsed);
            // The panic handler will print the payload contents
            panic::resume_unwind(payload);
        }
    }
}
