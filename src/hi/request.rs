use crate::error::{FastcgiError, Result};
use crate::hi::info::RequestInfo;
use crate::hi::response::{AddMode, HeaderAdded, HeaderTable};
use crate::lowlevel::{BeginRequest, NameValues};
use crate::s11n::Role;

use bytes::Bytes;

use std::any::Any;
use std::collections::VecDeque;
use std::time::SystemTime;

/// Position of a request within its protocol sequence. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Begin,
    ParamsDone,
    HeadersAllowed,
    HeadersEnd,
    BodyAllowed,
}

/// One live request multiplexed on a connection.
pub struct FastcgiRequest {
    id: u16,
    begin: BeginRequest,
    phase: Phase,
    pub(crate) params: VecDeque<NameValues>,
    pub(crate) stdin: VecDeque<Bytes>,
    pub(crate) data: VecDeque<Bytes>,
    pub(crate) stdout: VecDeque<Bytes>,
    pub(crate) stderr_used: bool,
    headers: HeaderTable,
    info: RequestInfo,
    pub(crate) complete: bool,
    user_data: Option<Box<dyn Any + Send>>,
}

impl FastcgiRequest {
    pub fn new(id: u16, begin: BeginRequest) -> FastcgiRequest {
        FastcgiRequest {
            id,
            begin,
            phase: Phase::Begin,
            params: VecDeque::new(),
            stdin: VecDeque::new(),
            data: VecDeque::new(),
            stdout: VecDeque::new(),
            stderr_used: false,
            headers: HeaderTable::new(),
            info: RequestInfo::default(),
            complete: false,
            user_data: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> Option<Role> {
        self.begin.role()
    }

    pub fn keep_connection(&self) -> bool {
        self.begin.keep_connection()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves to `phase` if it lies ahead of the current one. Returns whether it moved.
    pub fn advance_phase(&mut self, phase: Phase) -> bool {
        if phase > self.phase {
            trace!("request {}: {:?} -> {:?}", self.id, self.phase, phase);
            self.phase = phase;
            true
        } else {
            false
        }
    }

    /// Set once EndRequest has been sent (or the connection died).
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// First value of `name` across all Params records, in arrival order.
    pub fn param(&self, name: &str) -> Option<&Bytes> {
        self.params.iter()
            .find_map(|pairs| pairs.get(name.as_bytes()))
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn params(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.params.iter().flat_map(|pairs| pairs.iter())
    }

    /// Stdin payloads received so far; the empty end-of-stream record included.
    pub fn stdin(&self) -> &VecDeque<Bytes> {
        &self.stdin
    }

    pub fn data(&self) -> &VecDeque<Bytes> {
        &self.data
    }

    /// Refreshes `info()` from the accumulated params.
    pub fn fill_info(&mut self) {
        let params = &self.params;
        self.info = RequestInfo::fill(|name| {
            params.iter()
                .find_map(|pairs| pairs.get(name.as_bytes()))
                .map(|v| &v[..])
        });
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn headers(&self) -> &HeaderTable {
        &self.headers
    }

    fn check_headers_allowed(&self) -> Result<()> {
        if self.phase > Phase::HeadersAllowed {
            warn!("request {}: headers already sent", self.id);
            return Err(FastcgiError::RequestState(self.phase));
        }
        Ok(())
    }

    pub fn add_header<N, V>(&mut self, mode: AddMode, name: N, value: Option<V>)
        -> Result<HeaderAdded>
        where N: Into<String>, V: Into<String>
    {
        self.check_headers_allowed()?;
        Ok(self.headers.add(mode, name.into(), value.map(Into::into)))
    }

    /// Adds a header whose value is an HTTP-date.
    pub fn add_header_time<N: Into<String>>(&mut self, mode: AddMode, name: N, time: SystemTime)
        -> Result<HeaderAdded>
    {
        self.add_header(mode, name, Some(httpdate::fmt_http_date(time)))
    }

    pub fn remove_header(&mut self, name: &str) -> Result<usize> {
        self.check_headers_allowed()?;
        Ok(self.headers.remove(name))
    }

    /// Sets the CGI `Status` header, replacing any earlier one.
    pub fn set_status(&mut self, code: u16, text: &str) -> Result<()> {
        self.add_header(AddMode::Override, "Status", Some(format!("{} {}", code, text)))
            .map(|_| ())
    }

    pub fn set_user_data<T: Any + Send>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref().and_then(|d| d.downcast_ref())
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut().and_then(|d| d.downcast_mut())
    }

    pub fn take_user_data<T: Any>(&mut self) -> Option<Box<T>> {
        match self.user_data.take()?.downcast() {
            Ok(data) => Some(data),
            Err(other) => {
                self.user_data = Some(other);
                None
            },
        }
    }
}

impl std::fmt::Debug for FastcgiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FastcgiRequest")
            .field("id", &self.id)
            .field("begin", &self.begin)
            .field("phase", &self.phase)
            .field("headers", &self.headers.len())
            .field("complete", &self.complete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn request() -> FastcgiRequest {
        FastcgiRequest::new(3, BeginRequest::new(Role::Responder, true))
    }

    #[test]
    fn phases_only_advance() {
        let mut req = request();
        assert_eq!(Phase::Begin, req.phase());
        assert!(req.advance_phase(Phase::HeadersAllowed));
        assert!(!req.advance_phase(Phase::ParamsDone));
        assert_eq!(Phase::HeadersAllowed, req.phase());
        assert!(req.advance_phase(Phase::BodyAllowed));
        assert!(!req.advance_phase(Phase::BodyAllowed));
    }

    #[test]
    fn headers_rejected_after_headers_end() {
        let mut req = request();
        req.set_status(404, "Not Found").unwrap();
        req.advance_phase(Phase::HeadersEnd);
        match req.add_header(AddMode::Override, "X-Late", Some("1")) {
            Err(FastcgiError::RequestState(Phase::HeadersEnd)) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert!(req.remove_header("Status").is_err());
        assert_eq!(vec![("Status", Some("404 Not Found"))], req.headers().iter().collect::<Vec<_>>());
    }

    #[test]
    fn header_time_is_http_date() {
        let mut req = request();
        let time = UNIX_EPOCH + Duration::from_secs(784111777);
        req.add_header_time(AddMode::IfNotExists, "Last-Modified", time).unwrap();
        assert_eq!(Some(Some("Sun, 06 Nov 1994 08:49:37 GMT")), req.headers().get("last-modified"));
    }

    #[test]
    fn params_first_match_in_arrival_order() {
        let mut req = request();
        req.params.push_back(vec![("A", "1"), ("QUERY_STRING", "x=5")].into_iter().collect());
        req.params.push_back(vec![("A", "2"), ("B", "3")].into_iter().collect());
        assert_eq!(Some("1"), req.param_str("A"));
        assert_eq!(Some("3"), req.param_str("B"));
        assert_eq!(None, req.param("C"));
        assert_eq!(4, req.params().count());

        req.fill_info();
        assert_eq!(5, req.info().query_term_int("x", 10).unwrap());
    }

    #[test]
    fn user_data_downcasts() {
        let mut req = request();
        assert!(req.user_data::<u32>().is_none());
        req.set_user_data(41u32);
        *req.user_data_mut::<u32>().unwrap() += 1;
        assert!(req.take_user_data::<String>().is_none());
        assert_eq!(Some(Box::new(42u32)), req.take_user_data::<u32>());
        assert!(req.user_data::<u32>().is_none());
    }
}
