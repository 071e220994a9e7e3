//! Packed little-endian wire layouts.
//!
//! Messages are serialised through explicit byte accessors rather than struct casts so the
//! layouts stay portable across endian and alignment regimes. Field order and widths are frozen;
//! decoders reject short buffers and never read past the header plus the declared payload.

use crate::error::Error;
use crate::request::{Request, RequestType};
use crate::state::SLACK_HISTOGRAM_BINS;

/// 8-bit request-type ids registered with the transport.
pub const REQ_CLIENT_TO_LB: u8 = 1;
pub const REQ_LB_TO_WORKER: u8 = 2;
pub const REQ_STATE_UPDATE: u8 = 3;

/// Largest payload carried behind a request header.
pub const MAX_PAYLOAD_SIZE: usize = 4_096;

struct Cursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    fn put_u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn put_f32(&mut self, v: f32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn put_u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }

    fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], need: usize, what: &str) -> Result<Self, Error> {
        if buf.len() < need {
            return Err(Error::Decode(format!(
                "{what}: need {need} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self { buf, pos: 0 })
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn f32(&mut self) -> f32 {
        let v = f32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

/// Client → LB request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequestMsg {
    pub request_id: u64,
    pub client_send_time: u64,
    pub deadline: u64,
    pub service_time_hint_us: u32,
    pub client_id: u8,
    pub request_type: u8,
    pub payload_size: u16,
}

impl ClientRequestMsg {
    pub const SIZE: usize = 32;

    pub fn from_request(request: &Request) -> Self {
        Self {
            request_id: request.request_id,
            client_send_time: request.client_send_time,
            deadline: request.deadline,
            service_time_hint_us: request.service_time_hint_us,
            client_id: request.client_id,
            request_type: request.request_type.as_u8(),
            payload_size: request.payload_size,
        }
    }

    pub fn to_request(&self) -> Request {
        Request {
            request_id: self.request_id,
            client_send_time: self.client_send_time,
            deadline: self.deadline,
            service_time_hint_us: self.service_time_hint_us,
            request_type: RequestType::from_u8(self.request_type),
            client_id: self.client_id,
            payload_size: self.payload_size,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut c = Cursor::new(buf);
        c.put_u64(self.request_id);
        c.put_u64(self.client_send_time);
        c.put_u64(self.deadline);
        c.put_u32(self.service_time_hint_us);
        c.put_u8(self.client_id);
        c.put_u8(self.request_type);
        c.put_u16(self.payload_size);
        c.pos
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE, "client request")?;
        let msg = Self {
            request_id: r.u64(),
            client_send_time: r.u64(),
            deadline: r.u64(),
            service_time_hint_us: r.u32(),
            client_id: r.u8(),
            request_type: r.u8(),
            payload_size: r.u16(),
        };
        if msg.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::Decode(format!(
                "client request {} declares payload {} over the {MAX_PAYLOAD_SIZE} limit",
                msg.request_id, msg.payload_size
            )));
        }
        Ok(msg)
    }
}

/// LB → worker forwarded request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequestMsg {
    pub request_id: u64,
    pub client_send_time: u64,
    pub deadline: u64,
    pub lb_forward_time: u64,
    pub service_time_hint_us: u32,
    pub worker_id: u8,
    pub request_type: u8,
    pub payload_size: u16,
}

impl WorkerRequestMsg {
    pub const SIZE: usize = 40;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut c = Cursor::new(buf);
        c.put_u64(self.request_id);
        c.put_u64(self.client_send_time);
        c.put_u64(self.deadline);
        c.put_u64(self.lb_forward_time);
        c.put_u32(self.service_time_hint_us);
        c.put_u8(self.worker_id);
        c.put_u8(self.request_type);
        c.put_u16(self.payload_size);
        c.pos
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE, "worker request")?;
        let msg = Self {
            request_id: r.u64(),
            client_send_time: r.u64(),
            deadline: r.u64(),
            lb_forward_time: r.u64(),
            service_time_hint_us: r.u32(),
            worker_id: r.u8(),
            request_type: r.u8(),
            payload_size: r.u16(),
        };
        if msg.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::Decode(format!(
                "worker request {} declares payload {} over the {MAX_PAYLOAD_SIZE} limit",
                msg.request_id, msg.payload_size
            )));
        }
        Ok(msg)
    }
}

/// Worker → LB response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResponseMsg {
    pub request_id: u64,
    pub worker_recv_time: u64,
    pub worker_done_time: u64,
    pub queue_time_ns: u64,
    pub service_time_us: u32,
    pub queue_length: u16,
    pub worker_id: u8,
    pub success: u8,
}

impl WorkerResponseMsg {
    pub const SIZE: usize = 40;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut c = Cursor::new(buf);
        c.put_u64(self.request_id);
        c.put_u64(self.worker_recv_time);
        c.put_u64(self.worker_done_time);
        c.put_u64(self.queue_time_ns);
        c.put_u32(self.service_time_us);
        c.put_u16(self.queue_length);
        c.put_u8(self.worker_id);
        c.put_u8(self.success);
        c.pos
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE, "worker response")?;
        Ok(Self {
            request_id: r.u64(),
            worker_recv_time: r.u64(),
            worker_done_time: r.u64(),
            queue_time_ns: r.u64(),
            service_time_us: r.u32(),
            queue_length: r.u16(),
            worker_id: r.u8(),
            success: r.u8(),
        })
    }
}

/// LB → client response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponseMsg {
    pub request_id: u64,
    pub client_send_time: u64,
    pub e2e_latency_ns: u64,
    pub service_time_us: u32,
    pub worker_id: u8,
    pub deadline_met: u8,
    pub success: u8,
}

impl ClientResponseMsg {
    pub const SIZE: usize = 32;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut c = Cursor::new(buf);
        c.put_u64(self.request_id);
        c.put_u64(self.client_send_time);
        c.put_u64(self.e2e_latency_ns);
        c.put_u32(self.service_time_us);
        c.put_u8(self.worker_id);
        c.put_u8(self.deadline_met);
        c.put_u8(self.success);
        c.put_u8(0); // pad
        c.pos
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE, "client response")?;
        let msg = Self {
            request_id: r.u64(),
            client_send_time: r.u64(),
            e2e_latency_ns: r.u64(),
            service_time_us: r.u32(),
            worker_id: r.u8(),
            deadline_met: r.u8(),
            success: r.u8(),
        };
        r.skip(1);
        Ok(msg)
    }
}

/// Worker → LB state update, carrying the slack histogram for risk-aware dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdateMsg {
    pub queue_length: u16,
    pub active_requests: u16,
    pub completed_requests: u32,
    pub load_ema: f32,
    pub worker_id: u8,
    pub is_healthy: u8,
    pub slack_histogram: [u32; SLACK_HISTOGRAM_BINS],
}

impl StateUpdateMsg {
    pub const SIZE: usize = 16 + SLACK_HISTOGRAM_BINS * 4;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut c = Cursor::new(buf);
        c.put_u16(self.queue_length);
        c.put_u16(self.active_requests);
        c.put_u32(self.completed_requests);
        c.put_f32(self.load_ema);
        c.put_u8(self.worker_id);
        c.put_u8(self.is_healthy);
        c.put_u8(0); // pad
        c.put_u8(0); // pad
        for bin in &self.slack_histogram {
            c.put_u32(*bin);
        }
        c.pos
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, Self::SIZE, "state update")?;
        let queue_length = r.u16();
        let active_requests = r.u16();
        let completed_requests = r.u32();
        let load_ema = r.f32();
        let worker_id = r.u8();
        let is_healthy = r.u8();
        r.skip(2);
        let mut slack_histogram = [0u32; SLACK_HISTOGRAM_BINS];
        for bin in slack_histogram.iter_mut() {
            *bin = r.u32();
        }
        Ok(Self {
            queue_length,
            active_requests,
            completed_requests,
            load_ema,
            worker_id,
            is_healthy,
            slack_histogram,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_round_trip() {
        let msg = ClientRequestMsg {
            request_id: 0xDEAD_BEEF_0000_0001,
            client_send_time: 12_345,
            deadline: 99_999,
            service_time_hint_us: 42,
            client_id: 3,
            request_type: RequestType::Scan.as_u8(),
            payload_size: 128,
        };
        let mut buf = [0u8; ClientRequestMsg::SIZE];
        assert_eq!(msg.encode(&mut buf), ClientRequestMsg::SIZE);
        assert_eq!(ClientRequestMsg::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn worker_request_round_trip() {
        let msg = WorkerRequestMsg {
            request_id: 17,
            client_send_time: 100,
            deadline: 5_000,
            lb_forward_time: 180,
            service_time_hint_us: 55,
            worker_id: 4,
            request_type: RequestType::Put.as_u8(),
            payload_size: 300,
        };
        let mut buf = [0u8; WorkerRequestMsg::SIZE];
        assert_eq!(msg.encode(&mut buf), WorkerRequestMsg::SIZE);
        assert_eq!(WorkerRequestMsg::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn worker_response_round_trip() {
        let msg = WorkerResponseMsg {
            request_id: 9,
            worker_recv_time: 1_000,
            worker_done_time: 9_000,
            queue_time_ns: 500,
            service_time_us: 7,
            queue_length: 12,
            worker_id: 1,
            success: 1,
        };
        let mut buf = [0u8; WorkerResponseMsg::SIZE];
        assert_eq!(msg.encode(&mut buf), WorkerResponseMsg::SIZE);
        assert_eq!(WorkerResponseMsg::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn client_response_round_trip() {
        let msg = ClientResponseMsg {
            request_id: 77,
            client_send_time: 2_000,
            e2e_latency_ns: 44_000,
            service_time_us: 11,
            worker_id: 0,
            deadline_met: 1,
            success: 1,
        };
        let mut buf = [0u8; ClientResponseMsg::SIZE];
        assert_eq!(msg.encode(&mut buf), ClientResponseMsg::SIZE);
        assert_eq!(ClientResponseMsg::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn state_update_round_trip() {
        let mut slack_histogram = [0u32; SLACK_HISTOGRAM_BINS];
        slack_histogram[0] = 3;
        slack_histogram[5] = 17;
        slack_histogram[SLACK_HISTOGRAM_BINS - 1] = 1;
        let msg = StateUpdateMsg {
            queue_length: 40,
            active_requests: 4,
            completed_requests: 9_000,
            load_ema: 3.75,
            worker_id: 2,
            is_healthy: 1,
            slack_histogram,
        };
        let mut buf = [0u8; StateUpdateMsg::SIZE];
        assert_eq!(msg.encode(&mut buf), StateUpdateMsg::SIZE);
        assert_eq!(StateUpdateMsg::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn oversized_payload_declarations_are_rejected() {
        let msg = ClientRequestMsg {
            request_id: 1,
            client_send_time: 0,
            deadline: 1,
            service_time_hint_us: 1,
            client_id: 0,
            request_type: 0,
            payload_size: (MAX_PAYLOAD_SIZE + 1) as u16,
        };
        let mut buf = [0u8; ClientRequestMsg::SIZE];
        msg.encode(&mut buf);
        assert!(ClientRequestMsg::decode(&buf).is_err());
    }

    #[test]
    fn short_buffers_are_rejected() {
        let buf = [0u8; 8];
        assert!(ClientRequestMsg::decode(&buf).is_err());
        assert!(WorkerRequestMsg::decode(&buf).is_err());
        assert!(WorkerResponseMsg::decode(&buf).is_err());
        assert!(ClientResponseMsg::decode(&buf).is_err());
        assert!(StateUpdateMsg::decode(&buf).is_err());
    }
}
