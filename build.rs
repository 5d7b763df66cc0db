//! Build script for shadowkv.
//!
//! In a production build, this would compile the fused gather-matmul-RoPE
//! reconstruction kernel (the `cuda` feature's counterpart to
//! `inference::attention_kernel`'s CPU reference implementation) with
//! CUDA support and generate bindings via bindgen.
//!
//! For now, it's a placeholder that documents the intended build process.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Future: compile the CUDA gather-matmul-RoPE kernel.
    //
    // Steps:
    // 1. Check for CUDA toolkit (nvcc)
    // 2. Use cc::Build to compile the .cu sources
    // 3. Link against CUDA runtime (cudart, cublas)
    // 4. Generate bindings with bindgen
    //
    // Example (when implemented):
    //
    // ```
    // let cuda_path = std::env::var("CUDA_PATH")
    //     .unwrap_or_else(|_| "/usr/local/cuda".to_string());
    //
    // cc::Build::new()
    //     .cuda(true)
    //     .file("vendor/shadowkv_kernels/reconstruct.cu")
    //     .include(format!("{cuda_path}/include"))
    //     .compile("shadowkv_kernels");
    //
    // println!("cargo:rustc-link-search={cuda_path}/lib64");
    // println!("cargo:rustc-link-lib=cudart");
    // println!("cargo:rustc-link-lib=cublas");
    // ```

    #[cfg(feature = "cuda")]
    {
        println!("cargo:warning=CUDA feature enabled — ensure CUDA toolkit is installed");
    }
}
