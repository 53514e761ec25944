// Host implementations of the convolution and pooling kernels.
mod convolutions;
mod pooling;
