//! Memory images: hex text or raw little-endian words.
//!
//! The text form is a sequence of 32-bit hex words separated by whitespace.
//! `@addr` moves the load position to word address `addr`, `//` starts a
//! comment running to the end of the line.

use anyhow::{anyhow, Result};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, hex_digit1, multispace0, not_line_ending},
    combinator::{map, map_res},
    error::{Error, ErrorKind},
    sequence::preceded,
    IResult,
};

use crate::{
    addr::WORD_ADDR_BITS,
    memory::{self, Memory},
};

/// words at or above this address cannot be reached over the bus
const WORD_ADDR_LIMIT: u32 = 1 << WORD_ADDR_BITS;

/// Words loaded from consecutive addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// word address of the first word
    pub base: u32,
    pub words: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    blocks: Vec<Block>,
}

impl Image {
    pub fn parse_hex(s: &str) -> Result<Self> {
        let ImageBuilder { blocks } = ImageBuilder::from_hex(s).map_err(|n| match n {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                let consumed = s.len() - e.input.len();
                let line = s[..consumed].matches('\n').count() + 1;
                let token = e.input.split_whitespace().next().unwrap_or_default();
                if e.code == ErrorKind::TooLarge {
                    anyhow!("failed to parse memory image: `{token}` at line {line} lies beyond the word address space")
                } else {
                    anyhow!("failed to parse memory image: unexpected `{token}` at line {line}")
                }
            }
            nom::Err::Incomplete(_) => anyhow!("failed to parse memory image: truncated input"),
        })?;
        Ok(Self { blocks })
    }

    /// Raw little-endian words loaded from address 0. A trailing partial word
    /// is padded with zero bytes.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let words = bytes
            .chunks(4)
            .map(|c| {
                let mut v = [0u8; 4];
                v[..c.len()].copy_from_slice(c);
                u32::from_le_bytes(v)
            })
            .collect();
        Self {
            blocks: vec![Block { base: 0, words }],
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn word_count(&self) -> usize {
        self.blocks.iter().map(|b| b.words.len()).sum()
    }

    /// first word address past the highest loaded word
    pub fn end(&self) -> u32 {
        self.blocks
            .iter()
            .map(|b| b.base.saturating_add(b.words.len() as u32))
            .max()
            .unwrap_or(0)
    }

    pub fn load_into(&self, mem: &mut Memory) -> memory::Result<()> {
        for b in &self.blocks {
            mem.load(b.base, &b.words)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Token {
    Origin(u32),
    Word(u32),
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |s| u32::from_str_radix(s, 16))(input)
}

fn comment(input: &str) -> IResult<&str, &str> {
    preceded(tag("//"), not_line_ending)(input)
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((
        map(preceded(char('@'), hex_u32), Token::Origin),
        map(hex_u32, Token::Word),
    ))(input)
}

struct ImageBuilder {
    blocks: Vec<Block>,
}

impl ImageBuilder {
    fn new() -> Self {
        Self { blocks: Vec::new() }
    }
    /// word address the next word lands at
    fn cursor(&self) -> u32 {
        self.blocks
            .last()
            .map_or(0, |b| b.base + b.words.len() as u32)
    }
    fn push_word(&mut self, w: u32) {
        match self.blocks.last_mut() {
            Some(b) => b.words.push(w),
            None => self.blocks.push(Block {
                base: 0,
                words: vec![w],
            }),
        }
    }
    fn set_origin(&mut self, base: u32) {
        if self.blocks.last().is_some_and(|b| b.words.is_empty()) {
            self.blocks.pop();
        }
        self.blocks.push(Block {
            base,
            words: Vec::new(),
        });
    }
    fn skip_blank<'a>(&mut self, input: &'a str) -> IResult<&'a str, ()> {
        let (mut input, _) = multispace0(input)?;
        while let Ok((rest, _)) = comment(input) {
            input = multispace0(rest)?.0;
        }
        Ok((input, ()))
    }
    fn read_image<'a>(&mut self, input: &'a str) -> IResult<&'a str, ()> {
        let mut input_ = input;
        loop {
            let (input, _) = self.skip_blank(input_)?;
            if input.is_empty() {
                return Ok((input, ()));
            }
            let (rest, t) = token(input)?;
            let addr = match t {
                Token::Origin(base) => base,
                Token::Word(_) => self.cursor(),
            };
            if addr >= WORD_ADDR_LIMIT {
                return Err(nom::Err::Failure(Error::new(input, ErrorKind::TooLarge)));
            }
            match t {
                Token::Origin(base) => self.set_origin(base),
                Token::Word(w) => self.push_word(w),
            }
            input_ = rest;
        }
    }
    fn from_hex(input: &str) -> Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut s = Self::new();
        s.read_image(input)?;
        if s.blocks.last().is_some_and(|b| b.words.is_empty()) {
            s.blocks.pop();
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_words() {
        let image = Image::parse_hex("00000013 deadbeef\n  1\n").unwrap();
        assert_eq!(
            &[Block {
                base: 0,
                words: vec![0x13, 0xdead_beef, 1]
            }],
            image.blocks()
        );
    }
    #[test]
    fn test_hex_origin_and_comments() {
        let src = "// reset vector
@0 0000006f // jump to self
@40
// handler
00100073 00000013
@80 // empty block is dropped
@100 cafebabe
";
        let image = Image::parse_hex(src).unwrap();
        let bases: Vec<_> = image.blocks().iter().map(|b| b.base).collect();
        assert_eq!(vec![0, 0x40, 0x100], bases);
        assert_eq!(4, image.word_count());
        assert_eq!(0x101, image.end());
        let mut mem = Memory::new(0x10);
        image.load_into(&mut mem).unwrap();
        assert_eq!(Ok(0x0010_0073), mem.get(0x40));
        assert_eq!(Ok(0xcafe_babe), mem.get(0x100));
    }
    #[test]
    fn test_hex_errors() {
        let e = Image::parse_hex("0\n1\nxyz\n").unwrap_err();
        assert!(e.to_string().contains("`xyz` at line 3"), "{e}");
        // wider than a word
        assert!(Image::parse_hex("123456789").is_err());
        assert!(Image::parse_hex("@").is_err());
        // beyond the 30-bit word address space of the bus
        let e = Image::parse_hex("0\n@40000000 1").unwrap_err();
        assert!(e.to_string().contains("`@40000000` at line 2"), "{e}");
        let e = Image::parse_hex("@3fffffff 1\n2").unwrap_err();
        assert!(e.to_string().contains("`2` at line 2"), "{e}");
        let e = Image::parse_hex("@ffffffff 1 2").unwrap_err();
        assert!(e.to_string().contains("beyond the word address space"), "{e}");
    }
    #[test]
    fn test_le_bytes() {
        let image = Image::from_le_bytes(&[0x13, 0, 0, 0, 0xef, 0xbe, 0xad, 0xde, 0x01]);
        assert_eq!(vec![0x13, 0xdead_beef, 1], image.blocks()[0].words);
    }
}
