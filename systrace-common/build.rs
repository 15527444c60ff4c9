fn main() {
    prost_build::compile_protos(&["proto/systrace.proto"], &["proto/"])
        .expect("compile systrace.proto");
}
