use garde::Validate;
use image::{DynamicImage, GenericImageView};

use super::{Processor, ProcessorError};
use crate::models::job::{CropParams, JobParams};

/// Cuts a rectangle out of the source image.
#[derive(Debug, Default, Clone, Copy)]
pub struct CropProcessor;

impl CropProcessor {
    pub fn new() -> Self {
        Self
    }

    fn params<'a>(&self, params: &'a JobParams) -> Result<&'a CropParams, ProcessorError> {
        match params {
            JobParams::Crop(p) => Ok(p),
            other => Err(ProcessorError::mismatched(self.name(), other)),
        }
    }
}

/// Check that the crop rectangle lies inside an image of the given size.
pub fn check_bounds(
    params: &CropParams,
    image_width: u32,
    image_height: u32,
) -> Result<(), ProcessorError> {
    let right = params.x.saturating_add(params.width);
    if right > i64::from(image_width) {
        return Err(ProcessorError::ValidationFailed(format!(
            "crop area exceeds image width (x + width = {} > {})",
            right, image_width
        )));
    }
    let bottom = params.y.saturating_add(params.height);
    if bottom > i64::from(image_height) {
        return Err(ProcessorError::ValidationFailed(format!(
            "crop area exceeds image height (y + height = {} > {})",
            bottom, image_height
        )));
    }
    Ok(())
}

impl Processor for CropProcessor {
    fn name(&self) -> &str {
        "crop"
    }

    fn validate_params(&self, params: &JobParams) -> Result<(), ProcessorError> {
        self.params(params)?.validate()?;
        Ok(())
    }

    fn process(
        &self,
        image: &DynamicImage,
        params: &JobParams,
    ) -> Result<DynamicImage, ProcessorError> {
        let p = self.params(params)?;
        p.validate()?;
        let (width, height) = image.dimensions();
        check_bounds(p, width, height)?;

        // Ranges were validated above, so the casts cannot truncate.
        Ok(image.crop_imm(p.x as u32, p.y as u32, p.width as u32, p.height as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ResizeParams;

    fn crop(x: i64, y: i64, width: i64, height: i64) -> JobParams {
        JobParams::Crop(CropParams {
            x,
            y,
            width,
            height,
        })
    }

    fn source() -> DynamicImage {
        DynamicImage::new_rgba8(200, 200)
    }

    #[test]
    fn test_name() {
        assert_eq!(CropProcessor::new().name(), "crop");
    }

    #[test]
    fn test_validate_params() {
        let p = CropProcessor::new();
        let cases = [
            ("valid params", crop(10, 20, 100, 200), true),
            ("negative x", crop(-10, 20, 100, 200), false),
            ("negative y", crop(10, -20, 100, 200), false),
            ("zero width", crop(10, 20, 0, 200), false),
            ("height above maximum", crop(0, 0, 10, 10_001), false),
            ("origin is allowed", crop(0, 0, 1, 1), true),
        ];
        for (name, params, ok) in cases {
            assert_eq!(p.validate_params(&params).is_ok(), ok, "{}", name);
        }
    }

    #[test]
    fn test_validate_rejects_resize_parameters() {
        let params = JobParams::Resize(ResizeParams {
            width: 10,
            height: 10,
        });
        let err = CropProcessor::new().validate_params(&params).unwrap_err();
        assert!(matches!(err, ProcessorError::ValidationFailed(_)));
    }

    #[test]
    fn test_process_within_bounds() {
        let out = CropProcessor::new()
            .process(&source(), &crop(10, 10, 50, 50))
            .unwrap();
        assert_eq!(out.dimensions(), (50, 50));
    }

    #[test]
    fn test_process_full_image() {
        let out = CropProcessor::new()
            .process(&source(), &crop(0, 0, 200, 200))
            .unwrap();
        assert_eq!(out.dimensions(), (200, 200));
    }

    #[test]
    fn test_process_exceeding_bounds_fails() {
        let err = CropProcessor::new()
            .process(&source(), &crop(150, 150, 100, 100))
            .unwrap_err();
        match err {
            ProcessorError::ValidationFailed(msg) => assert!(msg.contains("250 > 200")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_process_revalidates_parameters() {
        let err = CropProcessor::new()
            .process(&source(), &crop(10, 10, 0, 50))
            .unwrap_err();
        assert!(matches!(err, ProcessorError::ValidationFailed(_)));
    }
}
