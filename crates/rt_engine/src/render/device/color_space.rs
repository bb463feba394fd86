//! Output selection and swapchain color space negotiation

use crate::render::api::{ColorSpace, Format, OutputDesc, Rect};

/// Output the window overlaps the most
///
/// Ties keep the output enumerated first. Returns `None` when no output
/// overlaps the window at all and there is nothing to fall back to.
pub fn best_output<'a>(outputs: &'a [OutputDesc], window: &Rect) -> Option<&'a OutputDesc> {
    let mut best: Option<(&OutputDesc, i64)> = None;
    for output in outputs {
        let area = window.intersection_area(&output.desktop_coordinates);
        match best {
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((output, area)),
        }
    }
    best.map(|(output, _)| output)
}

/// Color space to present in
///
/// HDR is used only when it was requested, the output is driven in HDR10 and
/// the back buffer format can carry it.
pub fn select_color_space(hdr_requested: bool, output: Option<&OutputDesc>, back_buffer_format: Format) -> ColorSpace {
    let output_is_hdr = output.is_some_and(|output| output.color_space == ColorSpace::Hdr10G2084P2020);
    if !hdr_requested || !output_is_hdr {
        return ColorSpace::SrgbG22P709;
    }
    match back_buffer_format {
        Format::Rgb10A2Unorm => ColorSpace::Hdr10G2084P2020,
        Format::Rgba16Float => ColorSpace::LinearG10P709,
        _ => ColorSpace::SrgbG22P709,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::HeadlessConfig;

    fn two_monitors() -> Vec<OutputDesc> {
        vec![
            HeadlessConfig::sdr_output("Left", Rect::new(0, 0, 1920, 1080)),
            HeadlessConfig::hdr_output("Right", Rect::new(1920, 0, 3840, 1080)),
        ]
    }

    #[test]
    fn test_best_output_by_overlap() {
        let outputs = two_monitors();
        let mostly_right = Rect::new(1800, 100, 2600, 700);
        assert_eq!(best_output(&outputs, &mostly_right).unwrap().name, "Right");
    }

    /// A window straddling both outputs equally stays on the first one
    #[test]
    fn test_tie_keeps_first_output() {
        let outputs = two_monitors();
        let straddling = Rect::new(1520, 0, 2320, 600);
        assert_eq!(best_output(&outputs, &straddling).unwrap().name, "Left");
    }

    #[test]
    fn test_offscreen_window_falls_back_to_first_output() {
        let outputs = two_monitors();
        let offscreen = Rect::new(-5000, -5000, -4000, -4000);
        assert_eq!(best_output(&outputs, &offscreen).unwrap().name, "Left");
        assert!(best_output(&[], &offscreen).is_none());
    }

    #[test]
    fn test_hdr_selection() {
        let outputs = two_monitors();
        let hdr = Some(&outputs[1]);
        assert_eq!(select_color_space(true, hdr, Format::Rgb10A2Unorm), ColorSpace::Hdr10G2084P2020);
        assert_eq!(select_color_space(true, hdr, Format::Rgba16Float), ColorSpace::LinearG10P709);
        assert_eq!(select_color_space(true, hdr, Format::Bgra8Unorm), ColorSpace::SrgbG22P709);
        assert_eq!(select_color_space(false, hdr, Format::Rgb10A2Unorm), ColorSpace::SrgbG22P709);
        assert_eq!(select_color_space(true, Some(&outputs[0]), Format::Rgb10A2Unorm), ColorSpace::SrgbG22P709);
        assert_eq!(select_color_space(true, None, Format::Rgb10A2Unorm), ColorSpace::SrgbG22P709);
    }
}
