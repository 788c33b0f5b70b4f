use std::fmt::Display;

use crate::{common::Pc, consumer::Retired};

/// Stops the simulation once the result at `pc` has been taken by the
/// consumer.
pub struct BreakPoint {
    pub pc: Pc,
    pub cond: Option<BreakPointCond>,
}

impl Display for BreakPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pc)?;
        if let Some(cond) = &self.cond {
            write!(f, " if {cond}")?;
        }
        Ok(())
    }
}

impl BreakPoint {
    pub fn new(pc: Pc) -> Self {
        Self {
            pc,
            cond: Default::default(),
        }
    }
    pub fn with_cond(pc: Pc, cond: BreakPointCond) -> Self {
        Self {
            pc,
            cond: Some(cond),
        }
    }

    pub fn matches(&self, r: &Retired) -> bool {
        if r.pc() != self.pc {
            return false;
        }
        match (&self.cond, r) {
            (None, _) => true,
            (Some(BreakPointCond::Illegal), Retired::Illegal { .. }) => true,
            (Some(BreakPointCond::Word(w)), Retired::Insn { word, .. }) => w == word,
            _ => false,
        }
    }
}

impl std::borrow::Borrow<Pc> for BreakPoint {
    fn borrow(&self) -> &Pc {
        &self.pc
    }
}

pub enum BreakPointCond {
    /// the fetch faulted
    Illegal,
    /// the fetched word equals
    Word(u32),
}

impl Display for BreakPointCond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakPointCond::Illegal => write!(f, "illegal"),
            BreakPointCond::Word(w) => write!(f, "word == {w:#010x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        let insn = Retired::Insn {
            pc: Pc::new(0x40),
            word: 0x13,
        };
        let fault = Retired::Illegal { pc: Pc::new(0x40) };
        assert!(BreakPoint::new(Pc::new(0x40)).matches(&insn));
        assert!(!BreakPoint::new(Pc::new(0x44)).matches(&insn));
        let bp = BreakPoint::with_cond(Pc::new(0x40), BreakPointCond::Illegal);
        assert!(!bp.matches(&insn));
        assert!(bp.matches(&fault));
        let bp = BreakPoint::with_cond(Pc::new(0x40), BreakPointCond::Word(0x13));
        assert!(bp.matches(&insn));
        assert!(!bp.matches(&fault));
        assert_eq!("0x00000040 if word == 0x00000013", bp.to_string());
    }
}
