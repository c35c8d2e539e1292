use garde::Validate;
use image::imageops::FilterType;
use image::DynamicImage;

use super::{Processor, ProcessorError};
use crate::models::job::{JobParams, ResizeParams};

/// Scales the source image to exact output dimensions.
#[derive(Debug, Clone, Copy)]
pub struct ResizeProcessor {
    filter: FilterType,
}

impl Default for ResizeProcessor {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl ResizeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: FilterType) -> Self {
        Self { filter }
    }

    fn params<'a>(&self, params: &'a JobParams) -> Result<&'a ResizeParams, ProcessorError> {
        match params {
            JobParams::Resize(p) => Ok(p),
            other => Err(ProcessorError::mismatched(self.name(), other)),
        }
    }
}

impl Processor for ResizeProcessor {
    fn name(&self) -> &str {
        "resize"
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
        Ok(image.resize_exact(p.width as u32, p.height as u32, self.filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn resize(width: i64, height: i64) -> JobParams {
        JobParams::Resize(ResizeParams { width, height })
    }

    #[test]
    fn test_name() {
        assert_eq!(ResizeProcessor::new().name(), "resize");
    }

    #[test]
    fn test_validate_params() {
        let p = ResizeProcessor::new();
        let cases = [
            ("valid params", resize(100, 200), true),
            ("zero width", resize(0, 200), false),
            ("negative height", resize(100, -200), false),
            ("exceeds max dimension", resize(20_000, 200), false),
            ("at max dimension", resize(10_000, 1), true),
        ];
        for (name, params, ok) in cases {
            assert_eq!(p.validate_params(&params).is_ok(), ok, "{}", name);
        }
    }

    #[test]
    fn test_process_resizes_to_exact_dimensions() {
        let source = DynamicImage::new_rgb8(200, 200);
        let out = ResizeProcessor::with_filter(FilterType::Nearest)
            .process(&source, &resize(100, 40))
            .unwrap();
        assert_eq!(out.dimensions(), (100, 40));
    }

    #[test]
    fn test_process_rejects_invalid_parameters() {
        let source = DynamicImage::new_rgb8(20, 20);
        assert!(ResizeProcessor::new()
            .process(&source, &resize(0, 10))
            .is_err());
    }
}
