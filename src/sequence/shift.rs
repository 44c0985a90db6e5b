use super::media::Media;
use super::{DiffBlock, blocks_from_changes};
use crate::SvnError;

/// Slides every changed block down while the line leaving the block equals
/// the line entering it, and joins changed blocks that end up touching.
///
/// Blocks only ever move toward the end of the file, so an ambiguous change
/// settles on its last possible position. The covered spans are unchanged.
/// The result is a fixed point: shifting it again returns the same blocks.
pub fn shift_blocks<M>(media: &mut M, blocks: &[DiffBlock]) -> Result<Vec<DiffBlock>, SvnError>
where
    M: Media + ?Sized,
{
    let left_len = media.left_len();
    let right_len = media.right_len();
    let changes: Vec<DiffBlock> = blocks.iter().filter(|b| !b.is_equal()).copied().collect();

    let mut shifted = Vec::with_capacity(changes.len());
    let mut next = 0;
    while next < changes.len() {
        let mut current = changes[next];
        next += 1;
        loop {
            if let Some(following) = changes.get(next)
                && (following.left_start == current.left_end()
                    || following.right_start == current.right_end())
            {
                current = DiffBlock::changed(
                    current.left_start,
                    following.left_end() - current.left_start,
                    current.right_start,
                    following.right_end() - current.right_start,
                );
                next += 1;
                continue;
            }
            if !can_shift(media, &current, left_len, right_len)? {
                break;
            }
            current.left_start += 1;
            current.right_start += 1;
        }
        shifted.push(current);
    }
    Ok(blocks_from_changes(&shifted, left_len, right_len))
}

fn can_shift<M>(
    media: &mut M,
    block: &DiffBlock,
    left_len: usize,
    right_len: usize,
) -> Result<bool, SvnError>
where
    M: Media + ?Sized,
{
    if block.left_end() >= left_len || block.right_end() >= right_len {
        return Ok(false);
    }
    if block.left_len > 0 && !media.equals_left(block.left_start, block.left_end())? {
        return Ok(false);
    }
    if block.right_len > 0 && !media.equals_right(block.right_start, block.right_end())? {
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::cancel::NeverCancel;
    use crate::sequence::media::CachingMedia;
    use crate::sequence::{BlockKind, blocks_from_runs};
    use crate::sequence::difference::Difference;
    use proptest::prelude::*;

    fn raw_blocks(media: &mut CachingMedia) -> Vec<DiffBlock> {
        let runs = Difference::new(media, usize::MAX, &NeverCancel).runs().unwrap();
        blocks_from_runs(&runs, media.left_len(), media.right_len())
    }

    #[test]
    fn insertion_slides_to_the_end_of_a_repeated_run() {
        // a b | b a  ->  inserting "b" after the first "b"
        let mut media = CachingMedia::from_classes(vec![0, 1, 0], vec![0, 1, 1, 0]);
        let blocks = vec![
            DiffBlock::equal(0, 0, 1),
            DiffBlock::changed(1, 0, 1, 1),
            DiffBlock::equal(1, 2, 2),
            DiffBlock::equal(3, 4, 0),
        ];
        let shifted = shift_blocks(&mut media, &blocks).unwrap();
        assert_eq!(
            shifted,
            vec![
                DiffBlock::equal(0, 0, 2),
                DiffBlock::changed(2, 0, 2, 1),
                DiffBlock::equal(2, 3, 1),
                DiffBlock::equal(3, 4, 0),
            ]
        );
    }

    #[test]
    fn touching_changes_are_joined() {
        let mut media = CachingMedia::from_classes(vec![0, 1, 2], vec![0, 3, 4, 2]);
        let blocks = vec![
            DiffBlock::equal(0, 0, 1),
            DiffBlock::changed(1, 1, 1, 1),
            DiffBlock::changed(2, 0, 2, 1),
            DiffBlock::equal(2, 3, 1),
            DiffBlock::equal(3, 4, 0),
        ];
        let shifted = shift_blocks(&mut media, &blocks).unwrap();
        assert_eq!(shifted[1], DiffBlock::changed(1, 1, 1, 2));
        assert_eq!(shifted.len(), 4);
        assert_eq!(shifted[1].kind, BlockKind::Changed);
    }

    proptest! {
        #[test]
        fn shifting_is_idempotent_and_keeps_spans(
            left in proptest::collection::vec(0u32..3, 0..40),
            right in proptest::collection::vec(0u32..3, 0..40),
        ) {
            let mut media = CachingMedia::from_classes(left.clone(), right.clone());
            let blocks = raw_blocks(&mut media);
            let once = shift_blocks(&mut media, &blocks).unwrap();
            let twice = shift_blocks(&mut media, &once).unwrap();
            prop_assert_eq!(&once, &twice);

            let left_total: usize = once.iter().map(|b| b.left_len).sum();
            let right_total: usize = once.iter().map(|b| b.right_len).sum();
            prop_assert_eq!(left_total, left.len());
            prop_assert_eq!(right_total, right.len());
            for block in once.iter().filter(|b| b.is_equal()) {
                for k in 0..block.left_len {
                    prop_assert_eq!(left[block.left_start + k], right[block.right_start + k]);
                }
            }
        }
    }
}
