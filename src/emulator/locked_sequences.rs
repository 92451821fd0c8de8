//! The three bit-exact locked-sequence skip patterns.
//!
//! A historical MP kernel executes `MFSPRG` between `LWARX`/`STWCX` to poll
//! a spinlock holder; because the hypervisor facility loses the
//! reservation across a VM exit, that sequence never completes. These
//! patterns are kept as data, not hand-inlined conditionals: each
//! entry is a trigger instruction (the `MFSPRG` that starts the sequence),
//! the exact followup encodings that must appear next, and how many
//! instructions to hop over once matched.

/// One locked-sequence pattern. `trigger` and `followups` are full 32-bit
/// instruction encodings, matched exactly (not masked) — these are
/// historical sequences from one specific compiler/kernel, not an
/// architectural form.
pub struct LockedSequence {
    pub trigger: u32,
    pub followups: &'static [u32],
    pub hop_words: u32,
    /// Bits 11..15 of `trigger` hold the target GPR (standard X-form RT
    /// field); kept explicit here rather than re-decoded at match time.
    pub target_gpr: u32,
}

fn rt_of(insn: u32) -> u32 {
    (insn >> 21) & 0x1f
}

/// mfsprg0,r4 ; stwcx. r4,0,r3 ; bne- -8 ; isync
const PATTERN_A_TRIGGER: u32 = 0x7C_90_42_A6; // mfspr r4, 272 (sprg0)
const PATTERN_A_FOLLOWUPS: [u32; 3] = [0x7C_83_192D, 0x4082_FFF8, 0x4C00_012C];

/// mfsprg0,r5 ; lwarx r4,0,r3 ; stwcx. r5,0,r3 ; bne- -8
const PATTERN_B_TRIGGER: u32 = 0x7C_B0_42A6; // mfspr r5, 272 (sprg0)
const PATTERN_B_FOLLOWUPS: [u32; 3] = [0x7C_83_0028, 0x7C_A3_192D, 0x4082_FFF8];

/// mfsprg0,r6 ; lwarx r0,0,r3 ; cmpw r0,r6 ; bne +0xC ; stwcx. r6,0,r3 ; bne- -0x10
const PATTERN_C_TRIGGER: u32 = 0x7C_D0_42A6; // mfspr r6, 272 (sprg0)
const PATTERN_C_FOLLOWUPS: [u32; 5] = [
    0x7C_03_0028,
    0x7C_06_0000,
    0x4082_000C,
    0x7C_C3_192D,
    0x4082_FFF0,
];

pub static PATTERNS: &[LockedSequence] = &[
    LockedSequence {
        trigger: PATTERN_A_TRIGGER,
        followups: &PATTERN_A_FOLLOWUPS,
        hop_words: 4,
        target_gpr: rt_of(PATTERN_A_TRIGGER),
    },
    LockedSequence {
        trigger: PATTERN_B_TRIGGER,
        followups: &PATTERN_B_FOLLOWUPS,
        hop_words: 4,
        target_gpr: rt_of(PATTERN_B_TRIGGER),
    },
    LockedSequence {
        trigger: PATTERN_C_TRIGGER,
        followups: &PATTERN_C_FOLLOWUPS,
        hop_words: 6,
        target_gpr: rt_of(PATTERN_C_TRIGGER),
    },
];

/// Try to match one of the patterns against `trigger` plus the words that
/// follow it in guest memory. Returns the matched pattern on success.
#[must_use]
pub fn match_at(trigger: u32, followups: &[u32]) -> Option<&'static LockedSequence> {
    PATTERNS.iter().find(|p| {
        p.trigger == trigger
            && followups.len() >= p.followups.len()
            && followups[..p.followups.len()] == *p.followups
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_a_matches_exactly() {
        let m = match_at(PATTERN_A_TRIGGER, &PATTERN_A_FOLLOWUPS).unwrap();
        assert_eq!(m.hop_words, 4);
        assert_eq!(m.target_gpr, 4);
    }

    #[test]
    fn wrong_followup_does_not_match() {
        let mut bad = PATTERN_B_FOLLOWUPS;
        bad[1] ^= 1;
        assert!(match_at(PATTERN_B_TRIGGER, &bad).is_none());
    }

    #[test]
    fn pattern_c_has_five_followups_and_six_word_hop() {
        let m = match_at(PATTERN_C_TRIGGER, &PATTERN_C_FOLLOWUPS).unwrap();
        assert_eq!(m.followups.len(), 5);
        assert_eq!(m.hop_words, 6);
    }
}
