//! Stack descriptor parsing and validation (spec §4.H, §6): a short ASCII
//! string naming which elements compose a stack and in what top-down
//! order, ported from the validation half of `GG_StackBuilder_BuildStack`
//! in `gg_stack_builder.c`.

use crate::error::{Error, Result};

/// One descriptor character, in the same top-down order the caller wrote
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    ActivityMonitor,
    Dtls,
    Gattlink,
    NetworkInterface,
    DatagramSocket,
}

impl ElementType {
    fn from_char(c: char) -> Result<ElementType> {
        match c {
            'A' => Ok(ElementType::ActivityMonitor),
            'D' => Ok(ElementType::Dtls),
            'G' => Ok(ElementType::Gattlink),
            'N' => Ok(ElementType::NetworkInterface),
            'S' => Ok(ElementType::DatagramSocket),
            _ => {
                log::warn!("stack: unsupported descriptor character '{c}'");
                Err(Error::NotSupported)
            }
        }
    }
}

/// Parses and validates a descriptor string: non-empty, ASCII, no
/// repeated characters (mirrors the original's `strchr`-based duplicate
/// scan). Returns the element types in the caller's top-down order.
pub fn parse(descriptor: &str) -> Result<Vec<ElementType>> {
    if descriptor.is_empty() {
        return Err(Error::InvalidParameters);
    }
    let chars: Vec<char> = descriptor.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if chars[i + 1..].contains(&c) {
            return Err(Error::InvalidParameters);
        }
    }
    chars.into_iter().map(ElementType::from_char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_descriptor_is_rejected() {
        assert_eq!(parse(""), Err(Error::InvalidParameters));
    }

    #[test]
    fn duplicate_character_is_rejected() {
        // spec §8 S6: "GNGS" has a duplicate 'G'.
        assert_eq!(parse("GNGS"), Err(Error::InvalidParameters));
    }

    #[test]
    fn unsupported_character_is_not_supported() {
        assert_eq!(parse("GX"), Err(Error::NotSupported));
    }

    #[test]
    fn gn_parses_to_two_elements_in_order() {
        let elements = parse("GN").unwrap();
        assert_eq!(elements, vec![ElementType::Gattlink, ElementType::NetworkInterface]);
    }
}
