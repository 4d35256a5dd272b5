/// A convergent trait that can be used to merge state of two replicas together. Returns true,
/// when self has been changed in result of merge operation (there were updates carried by
/// `other` that `self` didn't know about), or false otherwise.
///
/// `merge` operation is expected to be:
/// - idempotent: `a.merge(a) <=> a`
/// - commutative: `a.merge(b) <=> b.merge(a)`
/// - associative: `a.merge(b).merge(c) <=> a.merge(b.merge(c))`
pub trait Convergent {
    fn merge(&mut self, other: &Self) -> bool;
}

/// Keeps the greatest of two values. It's the merge of a single max watermark.
pub(crate) fn merge_max<T: Ord + Copy>(this: &mut Option<T>, other: Option<T>) -> bool {
    match (*this, other) {
        (_, None) => false,
        (Some(a), Some(b)) if a >= b => false,
        (_, Some(b)) => {
            *this = Some(b);
            true
        }
    }
}

/// Keeps the smallest of two values. It's the merge of a single min watermark.
pub(crate) fn merge_min<T: Ord + Copy>(this: &mut Option<T>, other: Option<T>) -> bool {
    match (*this, other) {
        (_, None) => false,
        (Some(a), Some(b)) if a <= b => false,
        (_, Some(b)) => {
            *this = Some(b);
            true
        }
    }
}

#[cfg(test)]
mod test {
    use crate::convergent::{merge_max, merge_min};

    #[test]
    fn watermark_merge() {
        let mut max = Some(3);
        assert!(!merge_max(&mut max, Some(2)));
        assert!(!merge_max(&mut max, None));
        assert!(merge_max(&mut max, Some(5)));
        assert_eq!(max, Some(5));

        let mut min = None;
        assert!(merge_min(&mut min, Some(4)));
        assert!(merge_min(&mut min, Some(1)));
        assert!(!merge_min(&mut min, Some(1)));
        assert_eq!(min, Some(1));
    }
}
