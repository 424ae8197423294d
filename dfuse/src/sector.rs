use nonempty::NonEmpty;
use regex::Regex;

use crate::error::DfuseError;

/// One independently erasable flash unit, as reported by the device
/// through its alternate-setting descriptor string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sector {
    pub name: String,
    pub alternate: u8,
    pub region_base: u32,
    pub start: u32,
    pub len: u32,
    pub mode: SectorMode,
}

impl Sector {
    pub fn end(&self) -> u32 {
        self.start + self.len
    }
}

/// Access bits encoded in the descriptor's trailing mode letter (`a`..`g`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorMode(u8);

impl SectorMode {
    pub fn from_code(code: char) -> Option<Self> {
        if ('a'..='g').contains(&code) {
            Some(SectorMode(code as u8 & 7))
        } else {
            None
        }
    }
    pub fn readable(&self) -> bool {
        self.0 & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.0 & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.0 & 4 == 4
    }
}

/// Parse one alternate setting's descriptor string, e.g.
/// `"@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg"`, into the
/// sectors it describes, in layout order.
///
/// Every malformed field is a hard error: guessing here could silently
/// shift the whole address map.
pub fn parse_region(
    alternate: u8,
    descriptor: &str,
) -> Result<NonEmpty<Sector>, DfuseError> {
    let bad = |msg: &str| DfuseError::Descriptor(format!("{msg}: {descriptor:?}"));

    let fields: Vec<&str> = descriptor.split('/').collect();
    let [label, base, layout] = fields[..] else {
        return Err(bad("expected \"@Label/0xADDR/layout\""));
    };

    let name = label.trim().trim_start_matches('@').trim().to_string();
    let region_base = parse_address(base.trim())
        .ok_or_else(|| bad("bad base address"))?;

    let term = Regex::new(r"^(\d+)\*(\d+)([ KM])([a-g])$").unwrap();
    let mut sectors = Vec::new();
    let mut cursor = region_base;

    for part in layout.split(',') {
        let caps = term
            .captures(part)
            .ok_or_else(|| bad("bad layout term"))?;
        let repeat: u32 = caps[1].parse().map_err(|_| bad("bad repeat count"))?;
        let size: u32 = caps[2].parse().map_err(|_| bad("bad sector size"))?;
        let unit: u32 = match &caps[3] {
            " " => 1,
            "K" => 1024,
            "M" => 1024 * 1024,
            _ => unreachable!(),
        };
        let mode_code =
            caps[4].chars().next().ok_or_else(|| bad("bad mode letter"))?;
        let mode = SectorMode::from_code(mode_code)
            .ok_or_else(|| bad("bad mode letter"))?;

        let len = size
            .checked_mul(unit)
            .ok_or_else(|| bad("sector size overflows"))?;
        if repeat == 0 || len == 0 {
            return Err(bad("zero-sized layout term"));
        }
        for _ in 0..repeat {
            sectors.push(Sector {
                name: name.clone(),
                alternate,
                region_base,
                start: cursor,
                len,
                mode,
            });
            cursor = cursor
                .checked_add(len)
                .ok_or_else(|| bad("layout overflows the address space"))?;
        }
    }

    NonEmpty::from_vec(sectors).ok_or_else(|| bad("empty layout"))
}

/// Flatten every alternate setting's layout into one map, preserving
/// discovery order.
pub fn build_sector_map<'a, I>(alternates: I) -> Result<Vec<Sector>, DfuseError>
where
    I: IntoIterator<Item = (u8, &'a str)>,
{
    let mut map = Vec::new();
    for (alt, descriptor) in alternates {
        map.extend(parse_region(alt, descriptor)?);
    }
    Ok(map)
}

fn parse_address(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stm32f4_flash_layout() {
        let sectors =
            parse_region(0, "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg")
                .unwrap();
        assert_eq!(sectors.len(), 12);
        assert!(sectors.iter().all(|s| s.name == "Internal Flash"));

        let lens: Vec<u32> = sectors.iter().map(|s| s.len).collect();
        assert_eq!(
            lens,
            [
                16384, 16384, 16384, 16384, 65536, 131072, 131072, 131072,
                131072, 131072, 131072, 131072
            ]
        );

        // contiguous and strictly increasing
        let mut addr = 0x0800_0000;
        for s in sectors.iter() {
            assert_eq!(s.start, addr);
            assert_eq!(s.region_base, 0x0800_0000);
            addr += s.len;
        }
        assert_eq!(sectors[4].start, 0x0801_0000);
        assert_eq!(sectors[5].start, 0x0802_0000);
    }

    #[test]
    fn option_bytes_layout() {
        let sectors =
            parse_region(1, "@Option Bytes   /0x1FFFC000/01*016 e").unwrap();
        assert_eq!(sectors.len(), 1);
        let s = sectors.first();
        assert_eq!(s.name, "Option Bytes");
        assert_eq!(s.alternate, 1);
        assert_eq!(s.start, 0x1FFF_C000);
        assert_eq!(s.len, 16);
        // 'e' encodes readable + writable, but not erasable
        assert!(s.mode.readable());
        assert!(s.mode.writable());
        assert!(!s.mode.erasable());
    }

    #[test]
    fn mode_letters() {
        let g = SectorMode::from_code('g').unwrap();
        assert!(g.readable() && g.erasable() && g.writable());
        let a = SectorMode::from_code('a').unwrap();
        assert!(a.readable() && !a.erasable() && !a.writable());
        assert!(SectorMode::from_code('z').is_none());
        assert!(SectorMode::from_code('G').is_none());
    }

    #[test]
    fn malformed_descriptors_are_fatal() {
        // wrong field count
        assert!(parse_region(0, "@Flash/0x08000000").is_err());
        assert!(parse_region(0, "no slashes at all").is_err());
        // non-numeric repeat / size
        assert!(parse_region(0, "@Flash/0x08000000/xx*016Kg").is_err());
        assert!(parse_region(0, "@Flash/0x08000000/04*yyKg").is_err());
        // unknown unit or mode letter
        assert!(parse_region(0, "@Flash/0x08000000/04*016Qg").is_err());
        assert!(parse_region(0, "@Flash/0x08000000/04*016Kz").is_err());
        // bad base address
        assert!(parse_region(0, "@Flash/0xZZZZ/04*016Kg").is_err());
        // empty layout
        assert!(parse_region(0, "@Flash/0x08000000/").is_err());
    }

    #[test]
    fn decimal_base_address() {
        let sectors = parse_region(0, "@Ram/536870912/01*001Kg").unwrap();
        assert_eq!(sectors.first().start, 0x2000_0000);
    }

    #[test]
    fn map_spans_alternates_in_order() {
        let map = build_sector_map([
            (0u8, "@Internal Flash  /0x08000000/02*016Kg"),
            (1u8, "@Option Bytes   /0x1FFFC000/01*016 e"),
        ])
        .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[0].alternate, 0);
        assert_eq!(map[1].start, 0x0800_4000);
        assert_eq!(map[2].alternate, 1);
    }
}
