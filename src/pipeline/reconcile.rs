//! Align the replacement list with the global image order.

use tracing::{debug, warn};

/// Return a list of exactly `total_images` replacements.
///
/// Missing entries become empty strings (the image vanishes from the
/// linearized text), excess entries are dropped. An empty list with images
/// present means image analysis was not requested and is only logged at
/// debug level.
pub fn reconcile(mut replacements: Vec<String>, total_images: usize) -> Vec<String> {
    let given = replacements.len();
    if given == total_images {
        return replacements;
    }

    if given == 0 {
        debug!("No image replacements supplied for {total_images} images");
    } else if given < total_images {
        warn!(
            "Replacement list shorter than image count ({given} < {total_images}), padding with empty entries"
        );
    } else {
        warn!(
            "Replacement list longer than image count ({given} > {total_images}), dropping {} entries",
            given - total_images
        );
    }

    replacements.resize(total_images, String::new());
    replacements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_list_with_images_becomes_all_empty() {
        assert_eq!(reconcile(vec![], 3), strings(&["", "", ""]));
    }

    #[test]
    fn short_list_is_padded() {
        assert_eq!(reconcile(strings(&["a"]), 3), strings(&["a", "", ""]));
    }

    #[test]
    fn long_list_is_truncated() {
        assert_eq!(reconcile(strings(&["a", "b", "c"]), 2), strings(&["a", "b"]));
    }

    #[test]
    fn equal_length_is_unchanged() {
        assert_eq!(reconcile(strings(&["a", "b"]), 2), strings(&["a", "b"]));
    }

    #[test]
    fn result_length_always_matches_image_count() {
        for given in 0..6 {
            for total in 0..6 {
                let input: Vec<String> = (0..given).map(|i| i.to_string()).collect();
                let out = reconcile(input, total);
                assert_eq!(out.len(), total, "given={given} total={total}");
            }
        }
        assert!(reconcile(strings(&["x", "y"]), 0).is_empty());
    }
}
