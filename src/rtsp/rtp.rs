//! RTP packetization
//!
//! H.264 follows RFC 6184 (single NAL unit packets, FU-A above the MTU). Opus
//! frames and AR packets always travel as one packet per unit.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::error::NetworkError;

pub const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;
const FU_A: u8 = 28;
const FU_HEADER_LEN: usize = 2;

/// Fixed RTP header fields, no CSRCs or extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8((u8::from(self.marker) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Read the header of a packet, `None` when too short or not version 2
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != RTP_VERSION {
            return None;
        }
        Some(Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7F,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        })
    }
}

/// Split an Annex B byte stream into NAL units (start codes removed)
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    if starts.is_empty() {
        return if data.is_empty() { Vec::new() } else { vec![data] };
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (n, &(_, payload_start)) in starts.iter().enumerate() {
        let end = match starts.get(n + 1) {
            Some(&(next_code, _)) => {
                // Four-byte start codes leave a zero behind
                let mut end = next_code;
                while end > payload_start && data[end - 1] == 0 {
                    end -= 1;
                }
                end
            }
            None => data.len(),
        };
        if end > payload_start {
            nals.push(&data[payload_start..end]);
        }
    }
    nals
}

/// Wrap a packet in `$`-framing for the RTSP connection
pub fn frame_interleaved(channel: u8, packet: &[u8], out: &mut BytesMut) -> Result<(), NetworkError> {
    let len = u16::try_from(packet.len()).map_err(|_| NetworkError::PacketTooLarge(packet.len()))?;
    out.reserve(4 + packet.len());
    out.put_u8(b'$');
    out.put_u8(channel);
    out.put_u16(len);
    out.put_slice(packet);
    Ok(())
}

/// Per-track packet sequencer
#[derive(Debug, Clone)]
pub struct RtpPacketizer {
    payload_type: u8,
    clock_rate: u32,
    ssrc: u32,
    sequence: u16,
    timestamp_offset: u32,
    mtu: usize,
}

impl RtpPacketizer {
    /// Random SSRC, initial sequence and timestamp offset
    pub fn new(payload_type: u8, clock_rate: u32, mtu: usize) -> Self {
        let mut rng = rand::rng();
        Self::with_state(
            payload_type,
            clock_rate,
            mtu,
            rng.random(),
            rng.random(),
            rng.random(),
        )
    }

    pub fn with_state(
        payload_type: u8,
        clock_rate: u32,
        mtu: usize,
        ssrc: u32,
        sequence: u16,
        timestamp_offset: u32,
    ) -> Self {
        Self {
            payload_type,
            clock_rate,
            ssrc,
            sequence,
            timestamp_offset,
            mtu: mtu.max(RTP_HEADER_LEN + FU_HEADER_LEN + 1),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Advance the sequence past units that were never sent
    pub fn skip(&mut self, units: u64) {
        self.sequence = self.sequence.wrapping_add(units as u16);
    }

    /// Media clock value for a session timestamp in microseconds
    pub fn rtp_timestamp(&self, micros: i64) -> u32 {
        let ticks = micros as i128 * self.clock_rate as i128 / 1_000_000;
        (ticks as u32).wrapping_add(self.timestamp_offset)
    }

    /// Packetize one access unit. The last packet carries the marker bit.
    pub fn packetize_h264(&mut self, access_unit: &[u8], micros: i64) -> Vec<Bytes> {
        let timestamp = self.rtp_timestamp(micros);
        let max_payload = self.mtu - RTP_HEADER_LEN;
        let nals = split_annex_b(access_unit);
        let mut packets = Vec::with_capacity(nals.len());

        for (n, nal) in nals.iter().enumerate() {
            let last_nal = n + 1 == nals.len();
            if nal.len() <= max_payload {
                packets.push(self.packet(last_nal, timestamp, &[], nal));
                continue;
            }

            let indicator = (nal[0] & 0xE0) | FU_A;
            let nal_type = nal[0] & 0x1F;
            let chunks: Vec<&[u8]> = nal[1..].chunks(max_payload - FU_HEADER_LEN).collect();
            for (c, chunk) in chunks.iter().enumerate() {
                let first = c == 0;
                let last = c + 1 == chunks.len();
                let fu_header = (u8::from(first) << 7) | (u8::from(last) << 6) | nal_type;
                packets.push(self.packet(last_nal && last, timestamp, &[indicator, fu_header], chunk));
            }
        }
        packets
    }

    /// One packet for the whole payload with the marker set.
    ///
    /// An oversized payload is refused but still consumes its sequence number,
    /// so receivers see the gap.
    pub fn packetize_single(
        &mut self,
        payload: &[u8],
        micros: i64,
        max_payload: usize,
    ) -> Result<Bytes, NetworkError> {
        if payload.len() > max_payload {
            self.skip(1);
            return Err(NetworkError::PacketTooLarge(payload.len()));
        }
        let timestamp = self.rtp_timestamp(micros);
        Ok(self.packet(true, timestamp, &[], payload))
    }

    fn packet(&mut self, marker: bool, timestamp: u32, prefix: &[u8], payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + prefix.len() + payload.len());
        RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp,
            ssrc: self.ssrc,
        }
        .write(&mut buf);
        buf.put_slice(prefix);
        buf.put_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packetizer(mtu: usize) -> RtpPacketizer {
        RtpPacketizer::with_state(96, 90_000, mtu, 0x1234_5678, 65_534, 1_000)
    }

    #[test]
    fn test_split_annex_b() {
        let data = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 5];
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![&[0x67, 1, 2][..], &[0x68, 3][..], &[0x65, 4, 5][..]]);
        assert!(split_annex_b(&[]).is_empty());
        // No start code: the whole buffer is one NAL
        assert_eq!(split_annex_b(&[0x65, 1]), vec![&[0x65, 1][..]]);
    }

    #[test]
    fn test_header_layout() {
        let mut p = packetizer(1400);
        let packet = p.packetize_single(b"abc", 1_000_000, 1000).unwrap();
        let header = RtpHeader::parse(&packet).unwrap();
        assert_eq!(packet[0], 0x80);
        assert!(header.marker);
        assert_eq!(header.payload_type, 96);
        assert_eq!(header.sequence, 65_534);
        assert_eq!(header.timestamp, 90_000 + 1_000);
        assert_eq!(header.ssrc, 0x1234_5678);
        assert_eq!(&packet[RTP_HEADER_LEN..], b"abc");
    }

    #[test]
    fn test_single_nal_and_marker() {
        let mut p = packetizer(1400);
        let au = [0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x65, 2];
        let packets = p.packetize_h264(&au, 0);
        assert_eq!(packets.len(), 2);
        assert!(!RtpHeader::parse(&packets[0]).unwrap().marker);
        assert!(RtpHeader::parse(&packets[1]).unwrap().marker);
        assert_eq!(&packets[1][RTP_HEADER_LEN..], &[0x65, 2]);
    }

    #[test]
    fn test_fu_a_fragmentation() {
        let mtu = 100;
        let mut p = packetizer(mtu);
        let mut au = vec![0, 0, 0, 1, 0x65];
        au.extend((0..500u32).map(|i| (i % 251) as u8 + 1));
        let packets = p.packetize_h264(&au, 0);
        assert!(packets.len() > 1);

        let mut rebuilt = vec![0x65];
        for (i, packet) in packets.iter().enumerate() {
            assert!(packet.len() <= mtu);
            let payload = &packet[RTP_HEADER_LEN..];
            assert_eq!(payload[0] & 0x1F, FU_A);
            assert_eq!(payload[0] & 0xE0, 0x65 & 0xE0);
            assert_eq!(payload[1] & 0x1F, 0x05);
            assert_eq!(payload[1] & 0x80 != 0, i == 0);
            assert_eq!(payload[1] & 0x40 != 0, i + 1 == packets.len());
            rebuilt.extend_from_slice(&payload[2..]);
        }
        assert_eq!(rebuilt, au[4..].to_vec());
    }

    #[test]
    fn test_oversized_single_payload() {
        let mut p = packetizer(1400);
        let seq = p.next_sequence();
        assert!(matches!(
            p.packetize_single(&[0u8; 2000], 0, 1500),
            Err(NetworkError::PacketTooLarge(2000))
        ));
        assert_eq!(p.next_sequence(), seq.wrapping_add(1));

        let next = p.packetize_single(&[1, 2, 3], 0, 1500).unwrap();
        assert_eq!(RtpHeader::parse(&next).unwrap().sequence, seq.wrapping_add(1));
    }

    #[test]
    fn test_skip_wraps() {
        let mut p = packetizer(1400);
        p.skip(3);
        assert_eq!(p.next_sequence(), 1);
    }

    #[test]
    fn test_interleaved_framing() {
        let mut out = BytesMut::new();
        frame_interleaved(2, &[9, 9, 9], &mut out).unwrap();
        assert_eq!(&out[..], &[b'$', 2, 0, 3, 9, 9, 9]);
        assert!(frame_interleaved(0, &vec![0u8; 70_000], &mut out).is_err());
    }

    proptest! {
        #[test]
        fn prop_sequence_is_contiguous(sizes in proptest::collection::vec(1usize..4000, 1..20)) {
            let mut p = packetizer(1200);
            let mut expected = p.next_sequence();
            for size in sizes {
                let mut au = vec![0, 0, 1, 0x41];
                au.extend(std::iter::repeat(7u8).take(size));
                for packet in p.packetize_h264(&au, 0) {
                    let header = RtpHeader::parse(&packet).unwrap();
                    prop_assert_eq!(header.sequence, expected);
                    prop_assert!(packet.len() <= 1200);
                    expected = expected.wrapping_add(1);
                }
            }
        }
    }
}
