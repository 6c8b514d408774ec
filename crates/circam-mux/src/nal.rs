//! H.264 NAL unit parsing and AVCC conversion.
//!
//! Encoders emit **Annex B** access units: NAL units separated by
//! `00 00 01` or `00 00 00 01` start codes. FLV stores **AVCC**: each NAL
//! unit prefixed by its 4-byte big-endian length, with SPS and PPS moved
//! into a one-off decoder configuration record.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Any other type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            _ => Self::Other,
        }
    }
}

impl NalUnitType {
    /// Parameter sets and delimiters live outside AVCC sample data.
    pub fn is_out_of_band(self) -> bool {
        matches!(self, Self::Sps | Self::Pps | Self::Aud)
    }
}

/// One NAL unit, header byte included, start code excluded.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_type: NalUnitType,
    pub data: Bytes,
}

/// Position and length of the next start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Split an Annex B stream into NAL units.
///
/// Bytes before the first start code are ignored.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut nals = Vec::new();
    let Some((mut pos, mut len)) = find_start_code(data, 0) else {
        return nals;
    };

    loop {
        let start = pos + len;
        let next = find_start_code(data, start);
        let end = next.map_or(data.len(), |(p, _)| p);

        let nal = &data[start..end];
        if let Some(&header) = nal.first() {
            nals.push(NalUnit {
                nal_type: NalUnitType::from(header),
                data: Bytes::copy_from_slice(nal),
            });
        }

        match next {
            Some((p, l)) => (pos, len) = (p, l),
            None => break,
        }
    }

    nals
}

/// Length-prefix NAL units (4-byte big-endian).
pub fn nals_to_avcc(nals: &[NalUnit]) -> Bytes {
    let size: usize = nals.iter().map(|n| 4 + n.data.len()).sum();
    let mut buf = BytesMut::with_capacity(size);
    for nal in nals {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }
    buf.freeze()
}

/// Convert one Annex B access unit to an AVCC sample, dropping SPS, PPS and
/// AUD units. Empty if nothing remains.
pub fn access_unit_to_avcc(access_unit: &[u8]) -> Bytes {
    let nals: Vec<NalUnit> = parse_annex_b(access_unit)
        .into_iter()
        .filter(|nal| !nal.nal_type.is_out_of_band())
        .collect();
    nals_to_avcc(&nals)
}

/// Returns true if the access unit carries an IDR slice.
pub fn contains_idr(access_unit: &[u8]) -> bool {
    parse_annex_b(access_unit)
        .iter()
        .any(|nal| nal.nal_type == NalUnitType::IdrSlice)
}

/// SPS and PPS of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Bytes,
    pub pps: Bytes,
}

impl ParameterSets {
    /// Find the last SPS and PPS in Annex B data.
    pub fn from_annex_b(data: &[u8]) -> Option<Self> {
        let mut sps = None;
        let mut pps = None;
        for nal in parse_annex_b(data) {
            match nal.nal_type {
                NalUnitType::Sps => sps = Some(nal.data),
                NalUnitType::Pps => pps = Some(nal.data),
                _ => {}
            }
        }
        Some(Self {
            sps: sps?,
            pps: pps?,
        })
    }

    /// AVC decoder configuration record (ISO 14496-15, 4-byte lengths).
    ///
    /// `None` if the SPS is too short to carry profile and level.
    pub fn decoder_config(&self) -> Option<Bytes> {
        let (sps, pps) = (&self.sps, &self.pps);
        if sps.len() < 4 {
            debug!(len = sps.len(), "SPS too short for decoder config");
            return None;
        }

        let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
        buf.put_u8(0x01); // configurationVersion
        buf.put_slice(&sps[1..4]); // profile, compatibility, level
        buf.put_u8(0xFF); // reserved | lengthSizeMinusOne = 3
        buf.put_u8(0xE1); // reserved | one SPS
        buf.put_u16(sps.len() as u16);
        buf.put_slice(sps);
        buf.put_u8(0x01); // one PPS
        buf.put_u16(pps.len() as u16);
        buf.put_slice(pps);
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1E];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn annex_b(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, unit) in units.iter().enumerate() {
            if i % 2 == 0 {
                out.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                out.extend_from_slice(&[0, 0, 1]);
            }
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn test_parse_mixed_start_codes() {
        let data = annex_b(&[&SPS, &PPS, &[0x65, 0x88, 0x84]]);
        let nals = parse_annex_b(&data);

        let types: Vec<_> = nals.iter().map(|n| n.nal_type).collect();
        assert_eq!(
            types,
            vec![NalUnitType::Sps, NalUnitType::Pps, NalUnitType::IdrSlice]
        );
        assert_eq!(nals[0].data.as_ref(), &SPS);
        assert_eq!(nals[2].data.as_ref(), &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_parse_ignores_leading_garbage_and_empty() {
        assert!(parse_annex_b(&[]).is_empty());
        assert!(parse_annex_b(&[0x12, 0x34]).is_empty());

        let nals = parse_annex_b(&[0xFF, 0, 0, 1, 0x41, 0x9A]);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal_type, NalUnitType::NonIdrSlice);
    }

    #[test]
    fn test_access_unit_to_avcc_drops_parameter_sets() {
        let data = annex_b(&[&[0x09, 0xF0], &SPS, &PPS, &[0x65, 0x88, 0x84]]);
        let avcc = access_unit_to_avcc(&data);
        assert_eq!(avcc.as_ref(), &[0, 0, 0, 3, 0x65, 0x88, 0x84]);
        assert!(contains_idr(&data));
    }

    #[test]
    fn test_parameter_sets_and_decoder_config() {
        let data = annex_b(&[&SPS, &PPS]);
        let params = ParameterSets::from_annex_b(&data).unwrap();
        let config = params.decoder_config().unwrap();

        assert_eq!(&config[..6], &[0x01, 0x42, 0x00, 0x1E, 0xFF, 0xE1]);
        assert_eq!(&config[6..8], &[0x00, 0x04]);
        assert_eq!(&config[8..12], &SPS);
        assert_eq!(config[12], 0x01);
        assert_eq!(&config[15..], &PPS);
    }

    #[test]
    fn test_missing_pps_yields_none() {
        let data = annex_b(&[&SPS, &[0x65, 0x88]]);
        assert!(ParameterSets::from_annex_b(&data).is_none());
    }

    #[test]
    fn test_short_sps_has_no_config() {
        let params = ParameterSets {
            sps: Bytes::from_static(&[0x67, 0x42]),
            pps: Bytes::from_static(&PPS),
        };
        assert!(params.decoder_config().is_none());
    }
}
