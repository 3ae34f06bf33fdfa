use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use internvl_core::{
    initialize_logging, load_image, load_tokenizer, parse_dtype, prompt_for, resolve_image_path,
    GenerationConfig, InternVLChatModel, ModelSize, DEFAULT_INPUT_SIZE, DEFAULT_MAX_NUM,
};
use tracing::info;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Local checkpoint directory or Hugging Face model id. The size tag is read from its
    /// last `-` separated component.
    #[arg(long = "model_name_or_path", default_value = "OpenGVLab/InternVL2-8B")]
    model_name_or_path: String,

    /// Image to ask about. The literal `None` means no image.
    #[arg(long = "image_path")]
    image_path: Option<String>,

    /// The question.
    #[arg(long)]
    text: String,

    /// Use CPU only
    #[arg(long)]
    cpu: bool,

    /// Model dtype: bf16, f16 or f32.
    #[arg(long, default_value = "bf16")]
    dtype: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging();

    #[cfg(feature = "metal")]
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::new_metal(0)?
    };
    #[cfg(not(feature = "metal"))]
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype = parse_dtype(&args.dtype)?;

    info!(
        "avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let model_size = ModelSize::from_model_path(&args.model_name_or_path)?;

    let image_path = resolve_image_path(args.image_path.as_deref());
    let pixel_values = match image_path {
        Some(path) => {
            let pixel_values = load_image(path, DEFAULT_INPUT_SIZE, DEFAULT_MAX_NUM, &device)?;
            Some(pixel_values.to_dtype(dtype)?)
        }
        None => None,
    };
    let question = prompt_for(&args.text, pixel_values.is_some());

    println!("model size: {model_size}");
    let tokenizer = load_tokenizer(model_size, &args.model_name_or_path)?;
    println!("tokenizer:\n{tokenizer:?}");
    println!("len(tokenizer): {}", tokenizer.len());

    let mut model = InternVLChatModel::from_pretrained(&args.model_name_or_path, dtype, &device)?;

    let generation_config = GenerationConfig::default();
    let out = model.chat(
        &tokenizer,
        pixel_values.as_ref(),
        &question,
        &generation_config,
        None,
        true,
    )?;
    println!("User: {question}\nAssistant: {}", out.response);
    Ok(())
}
