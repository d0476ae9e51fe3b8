/// Fixed-point distance to the DODAG root.
pub type Rank = u16;

pub const INFINITE_RANK: Rank = 0xffff;

/// The coarse-grained rank used for acceptability comparisons (RFC 6550
/// `DAGRank`).
pub fn dag_rank(rank: Rank, min_hoprankinc: u16) -> u16 {
    if min_hoprankinc == 0 {
        rank
    } else {
        rank / min_hoprankinc
    }
}

/// Lollipop counters per RFC 6550 §7.2: a linear initial region on top of
/// a circular region, comparable within a bounded window.
pub mod lollipop {
    pub const MAX_VALUE: u16 = 255;
    pub const CIRCULAR_REGION: u16 = 127;
    pub const SEQUENCE_WINDOWS: u16 = 16;
    pub const INIT: u8 = (MAX_VALUE - SEQUENCE_WINDOWS + 1) as u8;

    pub fn increment(counter: u8) -> u8 {
        let counter = counter as u16;
        if counter > CIRCULAR_REGION {
            ((counter + 1) & MAX_VALUE) as u8
        } else {
            ((counter + 1) & CIRCULAR_REGION) as u8
        }
    }

    pub fn greater_than(a: u8, b: u8) -> bool {
        let a = a as i32;
        let b = b as i32;
        let circular = CIRCULAR_REGION as i32;
        let windows = SEQUENCE_WINDOWS as i32;
        /* An initial value compared against an old circular value. */
        if a > circular && b <= circular {
            return (MAX_VALUE as i32 + 1 + b - a) > windows;
        }
        /* Plain comparison within the window, or a wrapped pair that is
           still comparable. */
        (a > b && (a - b) < windows) || (a < b && (b - a) > (circular + 1 - windows))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn increment_stays_in_region() {
            assert_eq!(increment(0), 1);
            assert_eq!(increment(126), 127);
            /* The circular region wraps onto itself. */
            assert_eq!(increment(127), 0);
            /* The linear region runs to 255 then enters the circle. */
            assert_eq!(increment(240), 241);
            assert_eq!(increment(255), 0);
        }

        #[test]
        fn greater_than_is_antisymmetric_in_window() {
            for base in [0u8, 5, 100, 120, 240] {
                for delta in 1..SEQUENCE_WINDOWS as u8 {
                    let newer = {
                        let mut v = base;
                        for _ in 0..delta {
                            v = increment(v);
                        }
                        v
                    };
                    assert!(greater_than(newer, base), "{newer} > {base}");
                    assert!(!greater_than(base, newer), "{base} !> {newer}");
                }
            }
        }

        #[test]
        fn restart_value_beats_aged_circular_values() {
            /* A rebooted counter re-enters at INIT and outranks circular
               values that have advanced past the comparison window. */
            assert!(greater_than(INIT, 1));
            assert!(greater_than(INIT, CIRCULAR_REGION as u8));
            assert!(!greater_than(INIT, 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dag_rank_floors() {
        assert_eq!(dag_rank(256, 256), 1);
        assert_eq!(dag_rank(511, 256), 1);
        assert_eq!(dag_rank(512, 256), 2);
        assert_eq!(dag_rank(700, 0), 700);
    }
}
